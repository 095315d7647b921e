//! Locating batch transactions on chain

use crate::cell::Address;
use crate::chain::{NodeClient, StackEntry, Transaction};
use crate::error::TxmResult;
use crate::trace::SentMessage;
use crate::tx::SignedMessage;
use crate::wallet::{WalletIdentity, WalletVersion};

use std::sync::Arc;
use tracing::{debug, trace};

/// Where a broadcast batch stands
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Inclusion {
    Pending,
    Included,
    /// `valid_until` passed without inclusion
    Expired,
}

/// Answers inclusion and lookup questions against the node
pub struct TraceTracker {
    node: Arc<dyn NodeClient>,
    page_size: usize,
    max_pages: usize,
}

impl TraceTracker {
    pub fn new(node: Arc<dyn NodeClient>, page_size: usize, max_pages: usize) -> Self {
        Self {
            node,
            page_size: page_size.max(1),
            max_pages: max_pages.max(1),
        }
    }

    /// Standard wallets compare seqnos; highload wallets ask the contract.
    ///
    /// `now_secs` must be read before calling so an expired answer is never racing inclusion.
    pub async fn inclusion(
        &self,
        wallet: &WalletIdentity,
        message: &SignedMessage,
        now_secs: u64,
    ) -> TxmResult<Inclusion> {
        let tip = self.node.current_tip().await?;
        let included = match &wallet.version {
            version @ (WalletVersion::HighloadV2 { .. } | WalletVersion::HighloadV3 { .. }) => {
                let query_id = message.query_id.unwrap_or(message.seqno);
                let mut args = vec![StackEntry::Int(query_id as i128)];
                if matches!(version, WalletVersion::HighloadV3 { .. }) {
                    args.push(StackEntry::Int(0));
                }
                let stack = self
                    .node
                    .run_get_method(&tip, &wallet.address, "processed?", args)
                    .await?;
                stack.first().and_then(StackEntry::as_int) == Some(-1)
            }
            _ => {
                let account = self.node.get_account(&tip, &wallet.address).await?;
                account.seqno as u64 > message.seqno
            }
        };

        Ok(if included {
            Inclusion::Included
        } else if now_secs > message.valid_until as u64 {
            Inclusion::Expired
        } else {
            Inclusion::Pending
        })
    }

    /// Transaction of `wallet` started by the external message `hash`
    pub async fn find_root(
        &self,
        wallet: &Address,
        hash: &[u8; 32],
    ) -> TxmResult<Option<Transaction>> {
        self.scan(wallet, None, |tx| tx.external_in_hash().as_ref() == Some(hash))
            .await
    }

    /// Destination transaction of an emitted message
    pub async fn find_hop(&self, sent: &SentMessage) -> TxmResult<Option<Transaction>> {
        self.scan(&sent.dst, Some(sent.created_lt), |tx| {
            tx.in_msg.as_ref().map_or(false, |m| sent.matches(m))
        })
        .await
    }

    /// Page backwards through `account` until `found` matches or `floor_lt` is passed
    async fn scan<F>(
        &self,
        account: &Address,
        floor_lt: Option<u64>,
        found: F,
    ) -> TxmResult<Option<Transaction>>
    where
        F: Fn(&Transaction) -> bool,
    {
        let mut before = None;
        for page in 0..self.max_pages {
            let txs = self
                .node
                .list_transactions(account, self.page_size, before)
                .await?;
            trace!("Scanned page {} of {} ({} transactions)", page, account, txs.len());

            if let Some(tx) = txs.iter().find(|tx| found(tx)) {
                debug!("Located transaction {} on {}", tx.hash_hex(), account);
                return Ok(Some(tx.clone()));
            }

            let Some(oldest) = txs.last() else {
                break;
            };
            if txs.len() < self.page_size || floor_lt.map_or(false, |floor| oldest.lt <= floor) {
                break;
            }
            before = Some((oldest.lt, oldest.hash));
        }
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::MessageKind;
    use crate::trace::message::tests::info;
    use crate::trace::tests::ScriptedNode;
    use crate::trace::MessageReceived;

    fn signed(seqno: u64, valid_until: u32, query_id: Option<u64>) -> SignedMessage {
        SignedMessage {
            seqno,
            valid_until,
            query_id,
            hash: [7; 32],
            boc: vec![],
            deploys_wallet: false,
        }
    }

    #[tokio::test]
    async fn test_standard_inclusion_by_seqno() {
        let node = Arc::new(ScriptedNode::default());
        let wallet =
            WalletIdentity::new(Address::new(0, [1; 32]), "00".repeat(32), WalletVersion::v3r2());
        node.set_seqno(wallet.address, 5);
        let tracker = TraceTracker::new(node.clone(), 4, 3);

        for (seqno, now, expected) in [
            (4, 50, Inclusion::Included),
            (5, 50, Inclusion::Pending),
            (5, 101, Inclusion::Expired),
        ] {
            let state = tracker
                .inclusion(&wallet, &signed(seqno, 100, None), now)
                .await
                .unwrap();
            assert_eq!(state, expected, "seqno {} at {}", seqno, now);
        }
    }

    #[tokio::test]
    async fn test_highload_inclusion_by_query_id() {
        let node = Arc::new(ScriptedNode::default());
        let wallet = WalletIdentity::new(
            Address::new(0, [1; 32]),
            "00".repeat(32),
            WalletVersion::highload_v3(),
        );
        node.mark_processed(wallet.address, 1025);
        let tracker = TraceTracker::new(node.clone(), 4, 3);

        assert_eq!(
            tracker.inclusion(&wallet, &signed(1024, 100, Some(1025)), 50).await.unwrap(),
            Inclusion::Included
        );
        assert_eq!(
            tracker.inclusion(&wallet, &signed(1025, 100, Some(1026)), 200).await.unwrap(),
            Inclusion::Expired
        );
    }

    #[tokio::test]
    async fn test_find_root_pages_back() {
        let node = Arc::new(ScriptedNode::default());
        let wallet = Address::new(0, [1; 32]);
        for lt in 1..=10u64 {
            let mut msg = info(MessageKind::ExternalIn, None, wallet, 0, 0, lt);
            msg.hash = [lt as u8; 32];
            node.push(ScriptedNode::tx(wallet, lt * 10, Some(msg), vec![]));
        }
        let tracker = TraceTracker::new(node.clone(), 3, 5);
        let found = tracker.find_root(&wallet, &[2; 32]).await.unwrap().unwrap();
        assert_eq!(found.lt, 20);
        assert!(tracker.find_root(&wallet, &[42; 32]).await.unwrap().is_none());

        let shallow = TraceTracker::new(node, 3, 1);
        assert!(shallow.find_root(&wallet, &[2; 32]).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_find_hop_matches_by_hash_or_route() {
        let node = Arc::new(ScriptedNode::default());
        let wallet = Address::new(0, [1; 32]);
        let counter = Address::new(0, [2; 32]);
        let out = info(MessageKind::Internal, Some(wallet), counter, 10, 1, 30);
        let parent = ScriptedNode::tx(wallet, 29, None, vec![out.clone()]);
        let sent = MessageReceived::from_transaction(&parent).outgoing_sent[0].clone();

        let tracker = TraceTracker::new(node.clone(), 4, 3);
        assert!(tracker.find_hop(&sent).await.unwrap().is_none());

        let mut arrived = out.clone();
        arrived.hash = [0xaa; 32];
        node.push(ScriptedNode::tx(counter, 31, Some(arrived), vec![]));
        let hop = tracker.find_hop(&sent).await.unwrap().unwrap();
        assert_eq!(hop.lt, 31);
    }
}
