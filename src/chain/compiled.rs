//! `.compiled.json` contract artifacts

use crate::cell::{from_boc_hex, ArcCell, CellExt};
use crate::error::{TxmError, TxmResult};

use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::Deserialize;
use std::path::Path;

const EXTENSION: &str = ".compiled.json";

#[derive(Debug, Deserialize)]
struct CompiledFile {
    hash: String,
    #[serde(rename = "hashBase64")]
    hash_base64: String,
    hex: String,
}

/// Contract code loaded from a compiled artifact
#[derive(Debug, Clone)]
pub struct CompiledContract {
    pub code: ArcCell,
}

impl CompiledContract {
    /// Load and verify a compiled artifact; both recorded hashes must match the code cell
    pub fn load(path: impl AsRef<Path>) -> TxmResult<Self> {
        let path = path.as_ref();
        let name = path.to_string_lossy();
        if !name.ends_with(EXTENSION) {
            return Err(TxmError::Validation(format!(
                "{} is not a {} file",
                name, EXTENSION
            )));
        }
        let raw = std::fs::read_to_string(path)
            .map_err(|e| TxmError::Config(format!("failed to read {}: {}", name, e)))?;
        Self::from_json(&raw)
    }

    pub fn from_json(raw: &str) -> TxmResult<Self> {
        let file: CompiledFile = serde_json::from_str(raw)
            .map_err(|e| TxmError::Validation(format!("malformed compiled contract: {}", e)))?;
        let code = from_boc_hex(&file.hex)?;

        let expected_hex = file.hash.to_lowercase();
        if code.hash_hex() != expected_hex {
            return Err(TxmError::Validation(format!(
                "code hash mismatch: file says {}, code is {}",
                expected_hex,
                code.hash_hex()
            )));
        }
        if STANDARD.encode(code.repr_hash()) != file.hash_base64 {
            return Err(TxmError::Validation(format!(
                "code hashBase64 mismatch: file says {}",
                file.hash_base64
            )));
        }
        Ok(Self { code })
    }

    pub fn code_hash(&self) -> [u8; 32] {
        self.code.repr_hash()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cell::{Cell, CellBuilder};
    use std::io::Write;

    fn artifact(code: &Cell) -> String {
        serde_json::json!({
            "hash": code.hash_hex(),
            "hashBase64": STANDARD.encode(code.repr_hash()),
            "hex": hex::encode(code.to_boc().unwrap()),
        })
        .to_string()
    }

    fn sample_code() -> Cell {
        let mut b = CellBuilder::new();
        b.store_u32(32, 0xff00f4a4).unwrap();
        b.build().unwrap()
    }

    #[test]
    fn test_load_verifies_hash() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("Counter.compiled.json");
        let code = sample_code();
        std::fs::File::create(&path)
            .unwrap()
            .write_all(artifact(&code).as_bytes())
            .unwrap();

        let loaded = CompiledContract::load(&path).unwrap();
        assert_eq!(loaded.code_hash(), code.repr_hash());
    }

    #[test]
    fn test_rejects_wrong_extension_and_tampered_hash() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("Counter.json");
        std::fs::write(&path, artifact(&sample_code())).unwrap();
        assert!(matches!(
            CompiledContract::load(&path),
            Err(TxmError::Validation(_))
        ));

        let mut value: serde_json::Value = serde_json::from_str(&artifact(&sample_code())).unwrap();
        value["hash"] = serde_json::Value::String(hex::encode([0u8; 32]));
        assert!(CompiledContract::from_json(&value.to_string()).is_err());

        let mut value: serde_json::Value = serde_json::from_str(&artifact(&sample_code())).unwrap();
        value["hashBase64"] = serde_json::Value::String(STANDARD.encode([0u8; 32]));
        assert!(CompiledContract::from_json(&value.to_string()).is_err());
    }
}
