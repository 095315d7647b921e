//! TVM compute and action phase exit codes

use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "i32", into = "i32")]
pub enum ExitCode {
    Success,
    SuccessVariant,
    StackUnderflow,
    StackOverflow,
    IntegerOverflow,
    IntegerOutOfExpectedRange,
    InvalidOpcode,
    TypeCheckError,
    CellOverflow,
    CellUnderflow,
    DictionaryError,
    UnknownError,
    FatalError,
    OutOfGas,
    OutOfGasVariant,
    VirtualizationError,
    ActionListInvalid,
    ActionListTooLong,
    ActionInvalidOrNotSupported,
    InvalidSourceAddress,
    InvalidDestinationAddress,
    NotEnoughToncoin,
    NotEnoughExtraCurrencies,
    OutboundMessageDoesNotFit,
    CannotProcessMessage,
    LibraryReferenceIsNull,
    LibraryChangeActionError,
    LibraryLimitsExceeded,
    AccountStateSizeExceeded,
    TolkUnmatchedOpcode,
    NullReference,
    InvalidSerializationPrefix,
    TactInvalidIncomingMessage,
    TactConstraintsError,
    TactAccessDenied,
    TactContractStopped,
    TactInvalidArgument,
    TactCodeNotFound,
    TactInvalidStandardAddress,
    TactNotBasechainAddress,
    /// Contract-defined code
    Custom(i32),
}

const TABLE: &[(ExitCode, i32, &str)] = &[
    (ExitCode::Success, 0, "standard successful execution"),
    (ExitCode::SuccessVariant, 1, "alternative successful execution"),
    (ExitCode::StackUnderflow, 2, "stack underflow"),
    (ExitCode::StackOverflow, 3, "stack overflow"),
    (ExitCode::IntegerOverflow, 4, "integer overflow"),
    (ExitCode::IntegerOutOfExpectedRange, 5, "range check error"),
    (ExitCode::InvalidOpcode, 6, "invalid opcode"),
    (ExitCode::TypeCheckError, 7, "type check error"),
    (ExitCode::CellOverflow, 8, "cell overflow"),
    (ExitCode::CellUnderflow, 9, "cell underflow"),
    (ExitCode::DictionaryError, 10, "dictionary error"),
    (ExitCode::UnknownError, 11, "unknown error"),
    (ExitCode::FatalError, 12, "fatal error"),
    (ExitCode::OutOfGas, 13, "out of gas"),
    (ExitCode::OutOfGasVariant, -14, "out of gas"),
    (ExitCode::VirtualizationError, 14, "virtualization error"),
    (ExitCode::ActionListInvalid, 32, "action list is invalid"),
    (ExitCode::ActionListTooLong, 33, "action list is too long"),
    (ExitCode::ActionInvalidOrNotSupported, 34, "action is invalid or not supported"),
    (ExitCode::InvalidSourceAddress, 35, "invalid source address in outbound message"),
    (ExitCode::InvalidDestinationAddress, 36, "invalid destination address in outbound message"),
    (ExitCode::NotEnoughToncoin, 37, "not enough Toncoin"),
    (ExitCode::NotEnoughExtraCurrencies, 38, "not enough extra currencies"),
    (
        ExitCode::OutboundMessageDoesNotFit,
        39,
        "outbound message does not fit into a cell after rewriting",
    ),
    (ExitCode::CannotProcessMessage, 40, "cannot process a message"),
    (ExitCode::LibraryReferenceIsNull, 41, "library reference is null"),
    (ExitCode::LibraryChangeActionError, 42, "library change action error"),
    (ExitCode::LibraryLimitsExceeded, 43, "library cell count or Merkle depth exceeded"),
    (ExitCode::AccountStateSizeExceeded, 50, "account state size exceeded limits"),
    (ExitCode::TolkUnmatchedOpcode, 63, "unmatched opcode"),
    (ExitCode::NullReference, 128, "null reference exception"),
    (ExitCode::InvalidSerializationPrefix, 129, "invalid serialization prefix"),
    (ExitCode::TactInvalidIncomingMessage, 130, "invalid incoming message"),
    (ExitCode::TactConstraintsError, 131, "constraints error"),
    (ExitCode::TactAccessDenied, 132, "access denied"),
    (ExitCode::TactContractStopped, 133, "contract stopped"),
    (ExitCode::TactInvalidArgument, 134, "invalid argument"),
    (ExitCode::TactCodeNotFound, 135, "code of a contract was not found"),
    (ExitCode::TactInvalidStandardAddress, 136, "invalid standard address"),
    (ExitCode::TactNotBasechainAddress, 138, "not a basechain address"),
];

impl ExitCode {
    pub fn code(&self) -> i32 {
        match self {
            ExitCode::Custom(c) => *c,
            known => TABLE
                .iter()
                .find(|(e, _, _)| e == known)
                .map(|(_, c, _)| *c)
                .unwrap_or_default(),
        }
    }

    pub fn describe(&self) -> &'static str {
        TABLE
            .iter()
            .find(|(e, _, _)| e == self)
            .map(|(_, _, d)| *d)
            .unwrap_or("contract-defined exit code")
    }

    pub fn is_success(&self) -> bool {
        matches!(self, ExitCode::Success | ExitCode::SuccessVariant)
    }

    /// Deployments carry an empty or unknown body, which contracts may reject
    /// after storing their state
    pub fn is_successful_deployment(&self) -> bool {
        matches!(
            self,
            ExitCode::Success | ExitCode::TolkUnmatchedOpcode | ExitCode::TactInvalidIncomingMessage
        )
    }
}

impl From<i32> for ExitCode {
    fn from(code: i32) -> Self {
        TABLE
            .iter()
            .find(|(_, c, _)| *c == code)
            .map(|(e, _, _)| *e)
            .unwrap_or(ExitCode::Custom(code))
    }
}

impl From<ExitCode> for i32 {
    fn from(e: ExitCode) -> Self {
        e.code()
    }
}

impl fmt::Display for ExitCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.code(), self.describe())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes_map_both_ways() {
        for (exit, code, _) in TABLE {
            assert_eq!(ExitCode::from(*code), *exit);
            assert_eq!(exit.code(), *code);
        }
        assert_eq!(ExitCode::from(-14), ExitCode::OutOfGasVariant);
        assert_eq!(ExitCode::from(14), ExitCode::VirtualizationError);
        assert_eq!(ExitCode::from(0xffff), ExitCode::Custom(0xffff));
        assert_eq!(ExitCode::Custom(0xffff).code(), 0xffff);
    }

    #[test]
    fn test_deployment_predicate() {
        assert!(ExitCode::from(0).is_successful_deployment());
        assert!(ExitCode::from(63).is_successful_deployment());
        assert!(ExitCode::from(130).is_successful_deployment());
        assert!(!ExitCode::from(1).is_successful_deployment());
        assert!(!ExitCode::from(9).is_successful_deployment());
        assert_eq!(ExitCode::CellUnderflow.to_string(), "9 (cell underflow)");
    }
}
