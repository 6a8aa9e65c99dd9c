//! JSON configuration files for the two daemons.

use std::fs;
use std::path::Path;

use anyhow::Context;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use uuid::Uuid;

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ClientConfig {
    #[serde(default)]
    pub auto_start: bool,
    pub listen_addr: String,
    pub server_addr: String,
    pub channel: Uuid,
    pub client: Uuid,
    pub fake_web_domain: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ServerConfig {
    #[serde(rename = "FakeWebURL")]
    pub fake_web_url: String,
    pub fronted_listen_addr: String,
    pub channel: Uuid,
    pub clients: Vec<ClientEntry>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ClientEntry {
    #[serde(rename = "ID")]
    pub id: Uuid,
    #[serde(rename = "ListenAddr")]
    pub listen_addr: String,
}

pub fn load<T: DeserializeOwned>(path: &Path) -> anyhow::Result<T> {
    let data = fs::read_to_string(path)
        .with_context(|| format!("reading config {}", path.display()))?;
    serde_json::from_str(&data).with_context(|| format!("parsing config {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_config_field_names() {
        let cfg: ClientConfig = serde_json::from_str(
            r#"{
                "AutoStart": true,
                "ListenAddr": "127.0.0.1:1080",
                "ServerAddr": "203.0.113.5:443",
                "Channel": "6ba7b810-9dad-11d1-80b4-00c04fd430c8",
                "Client": "6ba7b811-9dad-11d1-80b4-00c04fd430c8",
                "FakeWebDomain": "www.example.com"
            }"#,
        )
        .unwrap();
        assert!(cfg.auto_start);
        assert_eq!(cfg.listen_addr, "127.0.0.1:1080");
        assert_eq!(cfg.fake_web_domain, "www.example.com");
    }

    #[test]
    fn server_config_field_names() {
        let cfg: ServerConfig = serde_json::from_str(
            r#"{
                "FakeWebURL": "https://www.example.com",
                "FrontedListenAddr": "0.0.0.0:443",
                "Channel": "6ba7b810-9dad-11d1-80b4-00c04fd430c8",
                "Clients": [
                    {"ID": "6ba7b811-9dad-11d1-80b4-00c04fd430c8", "ListenAddr": "127.0.0.1:8441"}
                ]
            }"#,
        )
        .unwrap();
        assert_eq!(cfg.fake_web_url, "https://www.example.com");
        assert_eq!(cfg.clients.len(), 1);
        assert_eq!(cfg.clients[0].listen_addr, "127.0.0.1:8441");
    }
}
