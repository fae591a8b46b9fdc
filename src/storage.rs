use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{error, info, warn};

use crate::config::TradingParams;
use crate::model::{Alert, Credential, TradeLedgerEntry};

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("no durable copy could be written")]
    NoDurableCopy,
}

/// JSON file storage with a secondary backup copy per document.
///
/// The host filesystem is ephemeral: the data directory can vanish between
/// restarts. Every write goes to both the primary and the backup location;
/// a read that only finds the backup repairs the primary from it. This is an
/// at-least-one-durable-copy guarantee, not a transactional one.
pub struct FileStorage {
    credential_file: PathBuf,
    settings_file: PathBuf,
    backup_credential_file: PathBuf,
    backup_settings_file: PathBuf,
    trade_log_file: PathBuf,
    alert_log_file: PathBuf,
}

impl FileStorage {
    pub fn new(data_dir: &str) -> Self {
        Self::with_backup_dir(data_dir, std::env::temp_dir())
    }

    /// Storage with an explicit backup location instead of the system temp
    /// directory. Tests use this to stay isolated from each other.
    pub fn with_backup_dir(data_dir: &str, backup_dir: PathBuf) -> Self {
        let data_dir = PathBuf::from(data_dir);
        if let Err(e) = fs::create_dir_all(&data_dir) {
            error!("Failed to create data directory {:?}: {}", data_dir, e);
        }

        Self {
            credential_file: data_dir.join("token.json"),
            settings_file: data_dir.join("settings.json"),
            backup_credential_file: backup_dir.join("token_backup.json"),
            backup_settings_file: backup_dir.join("settings_backup.json"),
            trade_log_file: data_dir.join("trade_log.json"),
            alert_log_file: data_dir.join("alert_log.json"),
        }
    }

    pub fn save_credential(&self, credential: &Credential) -> Result<(), StoreError> {
        self.save_document(credential, &self.credential_file, &self.backup_credential_file)
    }

    pub fn load_credential(&self) -> Option<Credential> {
        self.load_document(&self.credential_file, &self.backup_credential_file)
    }

    pub fn clear_credential(&self) {
        let _ = fs::remove_file(&self.credential_file);
        let _ = fs::remove_file(&self.backup_credential_file);
    }

    pub fn save_settings(&self, params: &TradingParams) -> Result<(), StoreError> {
        self.save_document(params, &self.settings_file, &self.backup_settings_file)
    }

    pub fn load_settings(&self) -> Option<TradingParams> {
        self.load_document(&self.settings_file, &self.backup_settings_file)
    }

    /// Append one placed trade to the append-only ledger (JSON lines).
    pub fn append_trade(&self, entry: &TradeLedgerEntry) -> Result<(), StoreError> {
        self.append_line(&self.trade_log_file, entry)
    }

    /// Append one accepted alert to the append-only alert log.
    pub fn append_alert(&self, alert: &Alert) -> Result<(), StoreError> {
        self.append_line(&self.alert_log_file, alert)
    }

    fn append_line<T: Serialize>(&self, path: &Path, value: &T) -> Result<(), StoreError> {
        let mut line = serde_json::to_string(value)?;
        line.push('\n');
        let mut file = OpenOptions::new().create(true).append(true).open(path)?;
        file.write_all(line.as_bytes())?;
        Ok(())
    }

    fn save_document<T: Serialize>(
        &self,
        value: &T,
        primary: &Path,
        backup: &Path,
    ) -> Result<(), StoreError> {
        let data = serde_json::to_vec_pretty(value)?;

        let primary_ok = match fs::write(primary, &data) {
            Ok(()) => true,
            Err(e) => {
                error!("Failed to write {:?}: {}", primary, e);
                false
            }
        };
        let backup_ok = match fs::write(backup, &data) {
            Ok(()) => true,
            Err(e) => {
                error!("Failed to write backup {:?}: {}", backup, e);
                false
            }
        };

        if primary_ok || backup_ok {
            Ok(())
        } else {
            Err(StoreError::NoDurableCopy)
        }
    }

    fn load_document<T: DeserializeOwned + Serialize>(
        &self,
        primary: &Path,
        backup: &Path,
    ) -> Option<T> {
        if let Some(value) = read_json::<T>(primary) {
            return Some(value);
        }

        if let Some(value) = read_json::<T>(backup) {
            info!("Loaded {:?} from backup location", backup);
            // Repair the primary so the next read finds it
            match serde_json::to_vec_pretty(&value) {
                Ok(data) => {
                    if let Err(e) = fs::write(primary, data) {
                        warn!("Failed to restore {:?} from backup: {}", primary, e);
                    }
                }
                Err(e) => warn!("Failed to re-serialize backup document: {}", e),
            }
            return Some(value);
        }

        None
    }
}

fn read_json<T: DeserializeOwned>(path: &Path) -> Option<T> {
    if !path.exists() {
        return None;
    }
    match fs::read(path) {
        Ok(data) => match serde_json::from_slice(&data) {
            Ok(value) => Some(value),
            Err(e) => {
                error!("Failed to parse {:?}: {}", path, e);
                None
            }
        },
        Err(e) => {
            error!("Failed to read {:?}: {}", path, e);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{TradingConfig, TradingParams};
    use chrono::Utc;

    fn test_storage() -> (FileStorage, String) {
        let dir = std::env::temp_dir().join(format!("scanner_store_{}", uuid::Uuid::new_v4()));
        let dir_str = dir.to_string_lossy().to_string();
        let storage = FileStorage::with_backup_dir(&dir_str, dir);
        (storage, dir_str)
    }

    fn sample_credential() -> Credential {
        Credential {
            subject_id: "AB1234".to_string(),
            display_name: "Test User".to_string(),
            secret_token: "secret".to_string(),
            issued_at: Utc::now(),
            expires_at: Utc::now(),
        }
    }

    #[test]
    fn test_credential_round_trip() {
        let (storage, dir) = test_storage();
        storage.save_credential(&sample_credential()).unwrap();

        let loaded = storage.load_credential().expect("credential should load");
        assert_eq!(loaded.subject_id, "AB1234");

        storage.clear_credential();
        assert!(storage.load_credential().is_none());
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn test_backup_fallback_repairs_primary() {
        let (storage, dir) = test_storage();
        storage.save_credential(&sample_credential()).unwrap();

        // Lose the primary copy
        fs::remove_file(&storage.credential_file).unwrap();
        let loaded = storage.load_credential().expect("backup should cover the read");
        assert_eq!(loaded.display_name, "Test User");

        // The read must have repaired the primary
        assert!(storage.credential_file.exists());
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn test_settings_round_trip() {
        let (storage, dir) = test_storage();
        let params = TradingParams::from_config(&TradingConfig::default());
        storage.save_settings(&params).unwrap();
        assert_eq!(storage.load_settings(), Some(params));
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn test_trade_log_appends() {
        let (storage, dir) = test_storage();
        let entry = TradeLedgerEntry {
            id: uuid::Uuid::new_v4(),
            timestamp: Utc::now(),
            symbol: "INFY".to_string(),
            exchange: "NSE".to_string(),
            action: crate::model::TradeAction::Buy,
            price: rust_decimal_macros::dec!(100.0),
            quantity: 1,
            scanner: "Breakout".to_string(),
            order_id: "1".to_string(),
            stop_loss_order_id: None,
            target_order_id: None,
        };
        storage.append_trade(&entry).unwrap();
        storage.append_trade(&entry).unwrap();

        let contents = fs::read_to_string(&storage.trade_log_file).unwrap();
        assert_eq!(contents.lines().count(), 2);
        let _ = fs::remove_dir_all(dir);
    }
}
