use std::{
    collections::HashMap,
    env, fs,
    time::{SystemTime, UNIX_EPOCH},
};

use super::*;

fn no_env(_: &str) -> Option<String> {
    None
}

#[test]
fn socket_url_upgrades_scheme_and_carries_token() {
    let settings = ClientSettings::default();
    let url = settings
        .socket_url(Some(&ChatId::new("42")), "tok")
        .expect("url");
    assert_eq!(url.as_str(), "ws://localhost:3000/ws/chat/42/?token=tok");
}

#[test]
fn socket_url_uses_wss_for_https_and_encodes_token() {
    let settings = ClientSettings {
        api_url: "https://chat.example.com/".into(),
        ..ClientSettings::default()
    };
    let url = settings
        .socket_url(Some(&ChatId::new("7")), "a b+c")
        .expect("url");
    assert_eq!(url.scheme(), "wss");
    assert_eq!(url.path(), "/ws/chat/7/");
    assert_eq!(
        url.query_pairs().find(|(k, _)| k == "token").map(|(_, v)| v.into_owned()),
        Some("a b+c".to_string())
    );
}

#[test]
fn socket_url_without_room_targets_chat_root() {
    let url = ClientSettings::default()
        .socket_url(None, "tok")
        .expect("url");
    assert_eq!(url.path(), "/ws/chat/");
}

#[test]
fn socket_url_rejects_unusable_base() {
    let settings = ClientSettings {
        api_url: "ftp://files.example.com".into(),
        ..ClientSettings::default()
    };
    assert!(matches!(
        settings.socket_url(None, "tok"),
        Err(TransportError::InvalidEndpoint(_))
    ));
}

#[test]
fn rest_base_joins_prefix() {
    let settings = ClientSettings {
        api_url: "http://10.0.2.2:8000/".into(),
        ..ClientSettings::default()
    };
    assert_eq!(settings.rest_base(), "http://10.0.2.2:8000/api");
}

#[test]
fn file_values_are_overridden_by_env() {
    let suffix = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("clock")
        .as_nanos();
    let path = env::temp_dir().join(format!("chat_client_settings_{suffix}.toml"));
    fs::write(
        &path,
        "api_url = \"http://file-host:8000\"\nconnect_timeout_ms = 2500\npage_size = 20\n",
    )
    .expect("write settings");

    let vars: HashMap<&str, &str> = HashMap::from([
        ("APP__API_URL", "http://env-host:9000"),
        ("APP__RECONNECT_MAX_ATTEMPTS", "3"),
        ("APP__CONNECT_TIMEOUT_MS", "not-a-number"),
    ]);
    let settings = load_settings_from(&path, |key| vars.get(key).map(|v| v.to_string()));

    assert_eq!(settings.api_url, "http://env-host:9000");
    assert_eq!(settings.connect_timeout, Duration::from_millis(2500));
    assert_eq!(settings.page_size, 20);
    assert_eq!(settings.reconnect.max_attempts, 3);

    fs::remove_file(path).expect("cleanup");
}

#[test]
fn missing_file_keeps_defaults() {
    let settings = load_settings_from(Path::new("/definitely/not/here.toml"), no_env);
    assert_eq!(settings, ClientSettings::default());
}
