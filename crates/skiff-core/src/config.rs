//! Host configuration port: process-wide knobs and the persistence hooks the
//! core calls out through. The core holds no singletons; the embedder owns
//! one `Configuration` and shares it across sessions.

use std::cell::Cell;
use std::time::Duration;

type PasswordCodec = Box<dyn Fn(&str) -> String>;
type CacheLoader = Box<dyn Fn(&str) -> Option<String>>;
type CacheStore = Box<dyn Fn(&str, &str)>;

pub struct Configuration {
    /// Local port range scanned for a free tunnel listener.
    pub tunnel_local_port_low: u16,
    pub tunnel_local_port_high: u16,
    pub cache_directory_changes_max_size: usize,
    pub directory_cache_max_size: usize,
    /// Auto-retry window after a fatal open failure, measured from the first
    /// failure; 0 disables auto-reopen.
    pub session_reopen_auto: Duration,
    pub session_reopen_auto_max_retries: u32,
    /// Coalescing window of the keep-up-to-date monitor.
    pub keep_up_to_date_change_delay: Duration,
    /// Master switch for overwrite confirmations; when off every overwrite
    /// batch resolves to All.
    pub confirm_overwriting: Cell<bool>,

    encrypt_password: PasswordCodec,
    decrypt_password: PasswordCodec,
    load_directory_changes_cache: Option<CacheLoader>,
    save_directory_changes_cache: Option<CacheStore>,
}

impl Default for Configuration {
    fn default() -> Self {
        use base64::Engine as _;
        Self {
            tunnel_local_port_low: 50_000,
            tunnel_local_port_high: 50_099,
            cache_directory_changes_max_size: 100,
            directory_cache_max_size: 100,
            session_reopen_auto: Duration::from_secs(5),
            session_reopen_auto_max_retries: 5,
            keep_up_to_date_change_delay: Duration::from_millis(500),
            confirm_overwriting: Cell::new(true),
            // Placeholder codec; hosts with a key store install their own.
            encrypt_password: Box::new(|plain| {
                base64::engine::general_purpose::STANDARD.encode(plain)
            }),
            decrypt_password: Box::new(|sealed| {
                base64::engine::general_purpose::STANDARD
                    .decode(sealed)
                    .ok()
                    .and_then(|bytes| String::from_utf8(bytes).ok())
                    .unwrap_or_default()
            }),
            load_directory_changes_cache: None,
            save_directory_changes_cache: None,
        }
    }
}

impl Configuration {
    pub fn encrypt_password(&self, plain: &str) -> String {
        (self.encrypt_password)(plain)
    }

    pub fn decrypt_password(&self, sealed: &str) -> String {
        (self.decrypt_password)(sealed)
    }

    pub fn set_password_codec(&mut self, encrypt: PasswordCodec, decrypt: PasswordCodec) {
        self.encrypt_password = encrypt;
        self.decrypt_password = decrypt;
    }

    pub fn set_directory_changes_store(&mut self, load: CacheLoader, save: CacheStore) {
        self.load_directory_changes_cache = Some(load);
        self.save_directory_changes_cache = Some(save);
    }

    pub fn load_directory_changes_cache(&self, session_key: &str) -> Option<String> {
        self.load_directory_changes_cache
            .as_ref()
            .and_then(|load| load(session_key))
    }

    pub fn save_directory_changes_cache(&self, session_key: &str, blob: &str) {
        if let Some(save) = &self.save_directory_changes_cache {
            save(session_key, blob);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_codec_round_trips() {
        let config = Configuration::default();
        let sealed = config.encrypt_password("hunter2");
        assert_ne!(sealed, "hunter2");
        assert_eq!(config.decrypt_password(&sealed), "hunter2");
    }

    #[test]
    fn directory_changes_store_round_trip() {
        use std::cell::RefCell;
        use std::collections::HashMap;
        use std::rc::Rc;

        let store: Rc<RefCell<HashMap<String, String>>> = Rc::default();
        let mut config = Configuration::default();
        let load_store = Rc::clone(&store);
        let save_store = Rc::clone(&store);
        config.set_directory_changes_store(
            Box::new(move |key| load_store.borrow().get(key).cloned()),
            Box::new(move |key, blob| {
                save_store.borrow_mut().insert(key.to_string(), blob.to_string());
            }),
        );

        config.save_directory_changes_cache("user@host:22", "blob");
        assert_eq!(
            config.load_directory_changes_cache("user@host:22"),
            Some("blob".to_string())
        );
        assert_eq!(config.load_directory_changes_cache("other"), None);
    }
}
