use serde::Deserialize;
use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

/// Global configuration for the proxy
#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Global default settings for hosts
    #[serde(default)]
    pub defaults: HostDefaults,

    /// Managed host configurations
    #[serde(default)]
    pub hosts: Vec<HostConfig>,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct ServerConfig {
    /// Path to PID file (optional)
    pub pid_file: Option<String>,
}

/// Default settings applied to every host unless overridden per host
#[derive(Debug, Deserialize, Clone)]
pub struct HostDefaults {
    /// How long a pending connection waits for the host to start (default: 20)
    #[serde(default = "default_wake_timeout")]
    pub wake_timeout_secs: u64,

    /// Timeout of a single liveness probe in milliseconds (default: 1000)
    #[serde(default = "default_ping_timeout_ms")]
    pub ping_timeout_ms: u64,

    /// Delay between liveness probes while starting, in milliseconds (default: 1000)
    #[serde(default = "default_ping_interval_ms")]
    pub ping_interval_ms: u64,

    /// How often the idle reaper checks each host (default: 30)
    #[serde(default = "default_idle_check_interval")]
    pub idle_check_interval_secs: u64,

    /// Idle time after which an autostop host is put to sleep (default: 900)
    #[serde(default = "default_max_alive")]
    pub max_alive_secs: u64,

    /// Deadline for the initial client read in milliseconds (default: 500)
    #[serde(default = "default_peek_timeout_ms")]
    pub peek_timeout_ms: u64,

    /// How long a UDP forward waits for the upstream reply, in milliseconds (default: 1000)
    #[serde(default = "default_udp_reply_timeout_ms")]
    pub udp_reply_timeout_ms: u64,

    /// Overall timeout for one remote SSH command (default: 30)
    #[serde(default = "default_command_timeout")]
    pub command_timeout_secs: u64,
}

fn default_wake_timeout() -> u64 {
    20
}

fn default_ping_timeout_ms() -> u64 {
    1000
}

fn default_ping_interval_ms() -> u64 {
    1000
}

fn default_idle_check_interval() -> u64 {
    30
}

fn default_max_alive() -> u64 {
    900
}

fn default_peek_timeout_ms() -> u64 {
    500
}

fn default_udp_reply_timeout_ms() -> u64 {
    1000
}

fn default_command_timeout() -> u64 {
    30
}

impl Default for HostDefaults {
    fn default() -> Self {
        Self {
            wake_timeout_secs: default_wake_timeout(),
            ping_timeout_ms: default_ping_timeout_ms(),
            ping_interval_ms: default_ping_interval_ms(),
            idle_check_interval_secs: default_idle_check_interval(),
            max_alive_secs: default_max_alive(),
            peek_timeout_ms: default_peek_timeout_ms(),
            udp_reply_timeout_ms: default_udp_reply_timeout_ms(),
            command_timeout_secs: default_command_timeout(),
        }
    }
}

impl HostDefaults {
    pub fn wake_timeout(&self) -> Duration {
        Duration::from_secs(self.wake_timeout_secs)
    }

    pub fn ping_timeout(&self) -> Duration {
        Duration::from_millis(self.ping_timeout_ms)
    }

    pub fn ping_interval(&self) -> Duration {
        Duration::from_millis(self.ping_interval_ms)
    }

    pub fn idle_check_interval(&self) -> Duration {
        Duration::from_secs(self.idle_check_interval_secs)
    }

    pub fn peek_timeout(&self) -> Duration {
        Duration::from_millis(self.peek_timeout_ms)
    }

    pub fn udp_reply_timeout(&self) -> Duration {
        Duration::from_millis(self.udp_reply_timeout_ms)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }
}

/// Transport protocol of a proxied service
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    #[default]
    Tcp,
    Udp,
}

/// One exposed service of a host. Immutable once a proxy is built from it.
#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
pub struct ProxyConfig {
    /// Name of the service (unique within the host)
    pub name: String,

    /// Port the proxy listens on (bound on 0.0.0.0)
    pub listen_port: u16,

    /// Port of the service on the target host
    pub target_port: u16,

    /// Transport protocol (default: tcp)
    #[serde(default)]
    pub protocol: Protocol,
}

/// Configuration of one managed host
#[derive(Debug, Deserialize, Clone)]
pub struct HostConfig {
    /// Host name, the unique (case-insensitive) registry key
    pub name: String,

    /// IP address or DNS name of the host; resolved once at proxy construction
    pub ip: String,

    /// MAC address for Wake-on-LAN (used when no start_command is set)
    pub mac_address: Option<String>,

    /// SSH user for remote start/stop commands
    pub ssh_username: String,

    /// SSH password (alternative to ssh_key_path)
    pub ssh_password: Option<String>,

    /// Path to an SSH private key (alternative to ssh_password)
    pub ssh_key_path: Option<String>,

    /// SSH port (default: 22)
    #[serde(default = "default_ssh_port")]
    pub ssh_port: u16,

    /// Put the host to sleep after max_alive of inactivity (default: false)
    #[serde(default)]
    pub autostop: bool,

    /// Per-host idle limit in seconds, overrides defaults.max_alive_secs
    pub max_alive_secs: Option<u64>,

    /// Remote command that starts the host (e.g. issued to a hypervisor).
    /// When absent, wake sends a Wake-on-LAN packet to mac_address.
    pub start_command: Option<String>,

    /// Remote command that puts the host to sleep (default: systemctl suspend)
    pub stop_command: Option<String>,

    /// Docker API port on the host, exposed to status collaborators
    pub docker_port: Option<u16>,

    /// Proxied services of this host
    #[serde(default)]
    pub proxies: Vec<ProxyConfig>,
}

fn default_ssh_port() -> u16 {
    22
}

const DEFAULT_STOP_COMMAND: &str = "sudo systemctl suspend";

impl HostConfig {
    /// Upper-cased registry key for case-insensitive lookup
    pub fn key(&self) -> String {
        self.name.to_uppercase()
    }

    pub fn max_alive(&self, defaults: &HostDefaults) -> Duration {
        Duration::from_secs(self.max_alive_secs.unwrap_or(defaults.max_alive_secs))
    }

    pub fn stop_command(&self) -> &str {
        self.stop_command.as_deref().unwrap_or(DEFAULT_STOP_COMMAND)
    }
}

impl Config {
    /// Load and validate configuration from a TOML file
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            anyhow::anyhow!("Failed to read config file {}: {}", path.as_ref().display(), e)
        })?;

        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate cross-field invariants the type system cannot express
    pub fn validate(&self) -> anyhow::Result<()> {
        let mut names = HashSet::new();
        let mut listen_ports = HashSet::new();

        for host in &self.hosts {
            if host.name.trim().is_empty() {
                anyhow::bail!("Host with empty name");
            }
            if !names.insert(host.key()) {
                anyhow::bail!("Duplicate host name (case-insensitive): {}", host.name);
            }

            let mut proxy_names = HashSet::new();
            for proxy in &host.proxies {
                if !proxy_names.insert(proxy.name.clone()) {
                    anyhow::bail!(
                        "Duplicate proxy name '{}' on host {}",
                        proxy.name,
                        host.name
                    );
                }
                if !listen_ports.insert((proxy.protocol, proxy.listen_port)) {
                    anyhow::bail!(
                        "Listen port {} used twice (proxy '{}' on host {})",
                        proxy.listen_port,
                        proxy.name,
                        host.name
                    );
                }
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const SAMPLE: &str = r#"
[server]
pid_file = "/run/wakegate.pid"

[defaults]
wake_timeout_secs = 15
idle_check_interval_secs = 10

[[hosts]]
name = "nas"
ip = "10.0.0.5"
mac_address = "aa:bb:cc:dd:ee:ff"
ssh_username = "admin"
ssh_password = "secret"
autostop = true
max_alive_secs = 600

[[hosts.proxies]]
name = "ssh"
listen_port = 2222
target_port = 22

[[hosts.proxies]]
name = "dns"
listen_port = 5353
target_port = 53
protocol = "udp"

[[hosts]]
name = "htpc"
ip = "htpc.lan"
ssh_username = "media"
ssh_key_path = "/etc/wakegate/htpc_key"
"#;

    #[test]
    fn test_parse_sample() {
        let config: Config = toml::from_str(SAMPLE).unwrap();
        config.validate().unwrap();

        assert_eq!(config.server.pid_file.as_deref(), Some("/run/wakegate.pid"));
        assert_eq!(config.defaults.wake_timeout_secs, 15);
        // Untouched defaults keep their values
        assert_eq!(config.defaults.peek_timeout_ms, 500);
        assert_eq!(config.hosts.len(), 2);

        let nas = &config.hosts[0];
        assert_eq!(nas.key(), "NAS");
        assert!(nas.autostop);
        assert_eq!(nas.max_alive(&config.defaults), Duration::from_secs(600));
        assert_eq!(nas.stop_command(), "sudo systemctl suspend");
        assert_eq!(nas.proxies.len(), 2);
        assert_eq!(nas.proxies[0].protocol, Protocol::Tcp);
        assert_eq!(nas.proxies[1].protocol, Protocol::Udp);

        let htpc = &config.hosts[1];
        assert_eq!(htpc.ssh_port, 22);
        assert!(!htpc.autostop);
        assert_eq!(htpc.max_alive(&config.defaults), Duration::from_secs(900));
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(SAMPLE.as_bytes()).unwrap();

        let config = Config::load(file.path()).unwrap();
        assert_eq!(config.hosts.len(), 2);
    }

    #[test]
    fn test_load_missing_file() {
        let err = Config::load("/nonexistent/wakegate.toml").unwrap_err();
        assert!(err.to_string().contains("Failed to read config file"));
    }

    #[test]
    fn test_duplicate_host_names_rejected() {
        let toml = r#"
[[hosts]]
name = "nas"
ip = "10.0.0.5"
ssh_username = "admin"

[[hosts]]
name = "NAS"
ip = "10.0.0.6"
ssh_username = "admin"
"#;
        let config: Config = toml::from_str(toml).unwrap();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("Duplicate host name"));
    }

    #[test]
    fn test_duplicate_listen_ports_rejected() {
        let toml = r#"
[[hosts]]
name = "a"
ip = "10.0.0.5"
ssh_username = "admin"

[[hosts.proxies]]
name = "one"
listen_port = 8080
target_port = 80

[[hosts]]
name = "b"
ip = "10.0.0.6"
ssh_username = "admin"

[[hosts.proxies]]
name = "two"
listen_port = 8080
target_port = 80
"#;
        let config: Config = toml::from_str(toml).unwrap();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("used twice"));
    }

    #[test]
    fn test_same_port_different_protocol_allowed() {
        let toml = r#"
[[hosts]]
name = "a"
ip = "10.0.0.5"
ssh_username = "admin"

[[hosts.proxies]]
name = "tcp-dns"
listen_port = 5353
target_port = 53

[[hosts.proxies]]
name = "udp-dns"
listen_port = 5353
target_port = 53
protocol = "udp"
"#;
        let config: Config = toml::from_str(toml).unwrap();
        config.validate().unwrap();
    }

    #[test]
    fn test_proxy_config_equality() {
        let a = ProxyConfig {
            name: "ssh".to_string(),
            listen_port: 2222,
            target_port: 22,
            protocol: Protocol::Tcp,
        };
        let mut b = a.clone();
        assert_eq!(a, b);

        b.target_port = 23;
        assert_ne!(a, b);
    }
}
