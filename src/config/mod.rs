//! YAML configuration file model
//!
//! The file mirrors the runtime settings but with every field optional:
//! whatever a config omits keeps its default. `configVersion` gates the
//! import — anything outside the supported prefix is rejected wholesale and
//! the daemon keeps running on its current settings.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::models::GroupModel;

/// Version written into exported config files
pub const CONFIG_VERSION: &str = "0.1.2";

/// Accepted `configVersion` prefix
pub const SUPPORTED_VERSION_PREFIX: &str = "0.1.";

// ==================== Runtime settings ====================

/// Fully resolved application settings
#[derive(Debug, Clone)]
pub struct AppSettings {
    pub http_web: HttpWebSettings,
    pub dns_proxy: DnsProxySettings,
    pub netfilter: NetfilterSettings,
    pub link: Vec<String>,
    pub show_all_interfaces: bool,
    pub log_level: String,
}

#[derive(Debug, Clone)]
pub struct HttpWebSettings {
    pub enabled: bool,
    pub host: ServerSettings,
    pub skin: String,
}

#[derive(Debug, Clone)]
pub struct DnsProxySettings {
    pub host: ServerSettings,
    /// When non-empty, listen on each of these instead of `host`
    pub hosts: Vec<ServerSettings>,
    pub upstream: ServerSettings,
    pub disable_remap53: bool,
    pub disable_fake_ptr: bool,
    pub disable_drop_aaaa: bool,
    pub enable_ecs: bool,
}

impl DnsProxySettings {
    /// Effective listen addresses
    #[must_use]
    pub fn listen_hosts(&self) -> Vec<ServerSettings> {
        if self.hosts.is_empty() {
            vec![self.host.clone()]
        } else {
            self.hosts.clone()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerSettings {
    pub address: String,
    pub port: u16,
}

#[derive(Debug, Clone)]
pub struct NetfilterSettings {
    pub chain_prefix: String,
    pub ipset_prefix: String,
    pub additional_ttl: u32,
    pub disable_ipv4: bool,
    pub disable_ipv6: bool,
}

impl Default for AppSettings {
    fn default() -> Self {
        Self {
            http_web: HttpWebSettings {
                enabled: true,
                host: ServerSettings {
                    address: "[::]".to_string(),
                    port: 8080,
                },
                skin: "default".to_string(),
            },
            dns_proxy: DnsProxySettings {
                host: ServerSettings {
                    address: "[::]".to_string(),
                    port: 3553,
                },
                hosts: Vec::new(),
                upstream: ServerSettings {
                    address: "127.0.0.1".to_string(),
                    port: 53,
                },
                disable_remap53: false,
                disable_fake_ptr: false,
                disable_drop_aaaa: false,
                enable_ecs: false,
            },
            netfilter: NetfilterSettings {
                chain_prefix: "MT_".to_string(),
                ipset_prefix: "mt_".to_string(),
                additional_ttl: 3600,
                disable_ipv4: false,
                disable_ipv6: false,
            },
            link: vec!["br0".to_string()],
            show_all_interfaces: false,
            log_level: "info".to_string(),
        }
    }
}

impl AppSettings {
    /// Merge an optional-field config section over the current settings
    pub fn apply(&mut self, app: &AppSection) {
        if let Some(http) = &app.http_web {
            if let Some(enabled) = http.enabled {
                self.http_web.enabled = enabled;
            }
            if let Some(host) = &http.host {
                apply_server(&mut self.http_web.host, host);
            }
            if let Some(skin) = &http.skin {
                self.http_web.skin = skin.clone();
            }
        }

        if let Some(dns) = &app.dns_proxy {
            if let Some(host) = &dns.host {
                apply_server(&mut self.dns_proxy.host, host);
            }
            if let Some(hosts) = &dns.hosts {
                self.dns_proxy.hosts = hosts
                    .iter()
                    .map(|h| {
                        let mut server = self.dns_proxy.host.clone();
                        apply_server(&mut server, h);
                        server
                    })
                    .collect();
            }
            if let Some(upstream) = &dns.upstream {
                apply_server(&mut self.dns_proxy.upstream, upstream);
            }
            if let Some(v) = dns.disable_remap53 {
                self.dns_proxy.disable_remap53 = v;
            }
            if let Some(v) = dns.disable_fake_ptr {
                self.dns_proxy.disable_fake_ptr = v;
            }
            if let Some(v) = dns.disable_drop_aaaa {
                self.dns_proxy.disable_drop_aaaa = v;
            }
            if let Some(v) = dns.enable_ecs {
                self.dns_proxy.enable_ecs = v;
            }
        }

        if let Some(nf) = &app.netfilter {
            if let Some(ipt) = &nf.iptables {
                if let Some(prefix) = &ipt.chain_prefix {
                    self.netfilter.chain_prefix = prefix.clone();
                }
            }
            if let Some(ipset) = &nf.ipset {
                if let Some(prefix) = &ipset.table_prefix {
                    self.netfilter.ipset_prefix = prefix.clone();
                }
                if let Some(ttl) = ipset.additional_ttl {
                    self.netfilter.additional_ttl = ttl;
                }
            }
            if let Some(v) = nf.disable_ipv4 {
                self.netfilter.disable_ipv4 = v;
            }
            if let Some(v) = nf.disable_ipv6 {
                self.netfilter.disable_ipv6 = v;
            }
        }

        if let Some(link) = &app.link {
            self.link = link.clone();
        }
        if let Some(v) = app.show_all_interfaces {
            self.show_all_interfaces = v;
        }
        if let Some(level) = &app.log_level {
            self.log_level = level.clone();
        }
    }

    /// Render as a complete config section for export
    #[must_use]
    pub fn to_section(&self) -> AppSection {
        AppSection {
            http_web: Some(HttpWebSection {
                enabled: Some(self.http_web.enabled),
                host: Some(ServerSection {
                    address: Some(self.http_web.host.address.clone()),
                    port: Some(self.http_web.host.port),
                }),
                skin: Some(self.http_web.skin.clone()),
            }),
            dns_proxy: Some(DnsProxySection {
                host: Some(server_section(&self.dns_proxy.host)),
                hosts: if self.dns_proxy.hosts.is_empty() {
                    None
                } else {
                    Some(self.dns_proxy.hosts.iter().map(server_section).collect())
                },
                upstream: Some(server_section(&self.dns_proxy.upstream)),
                disable_remap53: Some(self.dns_proxy.disable_remap53),
                disable_fake_ptr: Some(self.dns_proxy.disable_fake_ptr),
                disable_drop_aaaa: Some(self.dns_proxy.disable_drop_aaaa),
                enable_ecs: Some(self.dns_proxy.enable_ecs),
            }),
            netfilter: Some(NetfilterSection {
                iptables: Some(IpTablesSection {
                    chain_prefix: Some(self.netfilter.chain_prefix.clone()),
                }),
                ipset: Some(IpSetSection {
                    table_prefix: Some(self.netfilter.ipset_prefix.clone()),
                    additional_ttl: Some(self.netfilter.additional_ttl),
                }),
                disable_ipv4: Some(self.netfilter.disable_ipv4),
                disable_ipv6: Some(self.netfilter.disable_ipv6),
            }),
            link: Some(self.link.clone()),
            show_all_interfaces: Some(self.show_all_interfaces),
            log_level: Some(self.log_level.clone()),
        }
    }
}

fn apply_server(target: &mut ServerSettings, section: &ServerSection) {
    if let Some(address) = &section.address {
        target.address = address.clone();
    }
    if let Some(port) = section.port {
        target.port = port;
    }
}

fn server_section(server: &ServerSettings) -> ServerSection {
    ServerSection {
        address: Some(server.address.clone()),
        port: Some(server.port),
    }
}

// ==================== File model ====================

/// Top-level config file
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigFile {
    pub config_version: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub app: Option<AppSection>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub groups: Option<Vec<GroupModel>>,
}

impl ConfigFile {
    /// Reject versions outside the supported prefix
    pub fn check_version(&self) -> Result<(), ConfigError> {
        if self.config_version.starts_with(SUPPORTED_VERSION_PREFIX) {
            Ok(())
        } else {
            Err(ConfigError::UnsupportedVersion)
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppSection {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub http_web: Option<HttpWebSection>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dns_proxy: Option<DnsProxySection>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub netfilter: Option<NetfilterSection>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub link: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub show_all_interfaces: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log_level: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HttpWebSection {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub enabled: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub host: Option<ServerSection>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub skin: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DnsProxySection {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub host: Option<ServerSection>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hosts: Option<Vec<ServerSection>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub upstream: Option<ServerSection>,
    #[serde(rename = "disableRemap53", skip_serializing_if = "Option::is_none")]
    pub disable_remap53: Option<bool>,
    #[serde(rename = "disableFakePTR", skip_serializing_if = "Option::is_none")]
    pub disable_fake_ptr: Option<bool>,
    #[serde(rename = "disableDropAAAA", skip_serializing_if = "Option::is_none")]
    pub disable_drop_aaaa: Option<bool>,
    #[serde(rename = "enableECS", skip_serializing_if = "Option::is_none")]
    pub enable_ecs: Option<bool>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerSection {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetfilterSection {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub iptables: Option<IpTablesSection>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ipset: Option<IpSetSection>,
    #[serde(rename = "disableIPv4", skip_serializing_if = "Option::is_none")]
    pub disable_ipv4: Option<bool>,
    #[serde(rename = "disableIPv6", skip_serializing_if = "Option::is_none")]
    pub disable_ipv6: Option<bool>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IpTablesSection {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chain_prefix: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IpSetSection {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub table_prefix: Option<String>,
    #[serde(rename = "additionalTTL", skip_serializing_if = "Option::is_none")]
    pub additional_ttl: Option<u32>,
}

// ==================== File I/O ====================

/// Read the config file; `Ok(None)` when it does not exist
pub fn load_file(path: impl AsRef<Path>) -> Result<Option<ConfigFile>, ConfigError> {
    let path = path.as_ref();
    let contents = match std::fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    let file: ConfigFile = serde_yaml::from_str(&contents)?;
    Ok(Some(file))
}

/// Write the config file, creating the parent directory when needed
pub fn save_file(path: impl AsRef<Path>, file: &ConfigFile) -> Result<(), ConfigError> {
    let path = path.as_ref();
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let out = serde_yaml::to_string(file)?;
    std::fs::write(path, out)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let settings = AppSettings::default();
        assert_eq!(settings.dns_proxy.host.port, 3553);
        assert_eq!(settings.dns_proxy.upstream.address, "127.0.0.1");
        assert_eq!(settings.netfilter.chain_prefix, "MT_");
        assert_eq!(settings.netfilter.ipset_prefix, "mt_");
        assert_eq!(settings.netfilter.additional_ttl, 3600);
        assert_eq!(settings.link, vec!["br0"]);
        assert_eq!(settings.log_level, "info");
    }

    #[test]
    fn test_version_gate() {
        let ok = ConfigFile {
            config_version: "0.1.2".into(),
            app: None,
            groups: None,
        };
        assert!(ok.check_version().is_ok());

        let bad = ConfigFile {
            config_version: "0.2.0".into(),
            app: None,
            groups: None,
        };
        assert!(matches!(
            bad.check_version().unwrap_err(),
            ConfigError::UnsupportedVersion
        ));
    }

    #[test]
    fn test_partial_yaml_keeps_defaults() {
        let yaml = r"
configVersion: 0.1.0
app:
  dnsProxy:
    host:
      port: 5353
  logLevel: debug
";
        let file: ConfigFile = serde_yaml::from_str(yaml).unwrap();
        let mut settings = AppSettings::default();
        settings.apply(file.app.as_ref().unwrap());

        assert_eq!(settings.dns_proxy.host.port, 5353);
        // Address untouched by the partial host section
        assert_eq!(settings.dns_proxy.host.address, "[::]");
        assert_eq!(settings.log_level, "debug");
        // Everything else keeps its default
        assert_eq!(settings.http_web.host.port, 8080);
        assert!(!settings.dns_proxy.disable_drop_aaaa);
    }

    #[test]
    fn test_yaml_field_spelling() {
        let yaml = r"
configVersion: 0.1.2
app:
  dnsProxy:
    disableFakePTR: true
    disableDropAAAA: true
    enableECS: true
  netfilter:
    ipset:
      tablePrefix: xx_
      additionalTTL: 60
    disableIPv6: true
";
        let file: ConfigFile = serde_yaml::from_str(yaml).unwrap();
        let mut settings = AppSettings::default();
        settings.apply(file.app.as_ref().unwrap());
        assert!(settings.dns_proxy.disable_fake_ptr);
        assert!(settings.dns_proxy.disable_drop_aaaa);
        assert!(settings.dns_proxy.enable_ecs);
        assert_eq!(settings.netfilter.ipset_prefix, "xx_");
        assert_eq!(settings.netfilter.additional_ttl, 60);
        assert!(settings.netfilter.disable_ipv6);
    }

    #[test]
    fn test_groups_parse_with_defaults() {
        let yaml = r#"
configVersion: 0.1.1
groups:
  - id: "0a0b0c0d"
    name: vpn
    interface: nwg0
    rules:
      - id: "00000001"
        name: site
        type: namespace
        rule: example.com
        enable: true
"#;
        let file: ConfigFile = serde_yaml::from_str(yaml).unwrap();
        let groups = file.groups.unwrap();
        assert_eq!(groups.len(), 1);
        let group = &groups[0];
        assert_eq!(group.id.to_string(), "0a0b0c0d");
        // Omitted fields fall back to their defaults
        assert_eq!(group.color, "#ffffff");
        assert!(group.enable);
        assert_eq!(group.rules.len(), 1);
    }

    #[test]
    fn test_export_round_trip() {
        let settings = AppSettings::default();
        let file = ConfigFile {
            config_version: CONFIG_VERSION.to_string(),
            app: Some(settings.to_section()),
            groups: Some(Vec::new()),
        };
        let yaml = serde_yaml::to_string(&file).unwrap();
        assert!(yaml.contains("configVersion: 0.1.2"));
        assert!(yaml.contains("chainPrefix: MT_"));

        let back: ConfigFile = serde_yaml::from_str(&yaml).unwrap();
        let mut settings2 = AppSettings::default();
        settings2.apply(back.app.as_ref().unwrap());
        assert_eq!(settings2.netfilter.chain_prefix, settings.netfilter.chain_prefix);
        assert_eq!(settings2.dns_proxy.host.port, settings.dns_proxy.host.port);
    }

    #[test]
    fn test_file_io_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");

        assert!(load_file(&path).unwrap().is_none());

        let file = ConfigFile {
            config_version: CONFIG_VERSION.to_string(),
            app: Some(AppSettings::default().to_section()),
            groups: None,
        };
        save_file(&path, &file).unwrap();

        let loaded = load_file(&path).unwrap().unwrap();
        assert_eq!(loaded.config_version, CONFIG_VERSION);
    }

    #[test]
    fn test_listen_hosts_fallback() {
        let mut settings = AppSettings::default();
        assert_eq!(settings.dns_proxy.listen_hosts().len(), 1);
        settings.dns_proxy.hosts = vec![
            ServerSettings {
                address: "192.168.1.1".into(),
                port: 53,
            },
            ServerSettings {
                address: "127.0.0.1".into(),
                port: 53,
            },
        ];
        assert_eq!(settings.dns_proxy.listen_hosts().len(), 2);
    }
}
