// SPDX-FileCopyrightText: 2024 Phoenix R&D GmbH <hello@phnx.im>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

use embercommon::DEFAULT_PORT_HTTP;
use serde::Deserialize;

/// Configuration for the server.
#[derive(Deserialize, Clone, Debug)]
pub struct Settings {
    pub application: ApplicationSettings,
    pub database: DatabaseSettings,
    pub redis: RedisSettings,
    /// If this isn't present, no push notifications are sent to Apple
    /// devices.
    pub apns: Option<ApnsSettings>,
    /// If this isn't present, no push notifications are sent through FCM.
    pub fcm: Option<FcmSettings>,
    /// If this isn't present, the third-party Android push channel is
    /// disabled.
    pub umeng: Option<UmengSettings>,
    #[serde(default)]
    pub push: PushSettings,
    #[serde(default)]
    pub offline: OfflineSettings,
    #[serde(default)]
    pub group: GroupSettings,
    #[serde(default)]
    pub accounts: AccountSettings,
    pub metrics: MetricsSettings,
}

/// Configuration for the application.
#[derive(Deserialize, Clone, Debug)]
pub struct ApplicationSettings {
    #[serde(default = "default_http_port")]
    pub port: u16,
    pub host: String,
    /// Identity of this node in the deployment. Defaults to `host:port`.
    #[serde(default)]
    pub node_id: Option<String>,
}

impl ApplicationSettings {
    pub fn node_id(&self) -> String {
        self.node_id
            .clone()
            .unwrap_or_else(|| format!("{}:{}", self.host, self.port))
    }
}

fn default_http_port() -> u16 {
    DEFAULT_PORT_HTTP
}

/// Configuration for the database.
#[derive(Deserialize, Clone, Debug)]
pub struct DatabaseSettings {
    pub username: String,
    pub password: String,
    pub port: u16,
    pub host: String,
    pub name: String,
    pub cacertpath: Option<String>,
}

impl DatabaseSettings {
    fn add_tls_mode(&self, mut connection_string: String) -> String {
        if let Some(ref ca_cert_path) = self.cacertpath {
            connection_string.push_str(&format!("?sslmode=verify-ca&sslrootcert={ca_cert_path}"));
        } else {
            tracing::warn!(
                "No CA certificate path set for database connection. TLS will not be enabled."
            );
        }
        connection_string
    }

    /// Get the connection string for the database.
    pub fn connection_string(&self) -> String {
        let connection_string = format!(
            "postgres://{}:{}@{}:{}/{}",
            self.username, self.password, self.host, self.port, self.name
        );
        self.add_tls_mode(connection_string)
    }
}

/// Configuration for the partitioned Redis layer and the pub/sub instance.
#[derive(Deserialize, Clone, Debug)]
pub struct RedisSettings {
    /// URL of the Redis used for cross-node pub/sub.
    pub pubsub: String,
    /// Partitions of the offline/group state, each with ordered replicas.
    pub partitions: Vec<PartitionSettings>,
}

#[derive(Deserialize, Clone, Debug)]
pub struct PartitionSettings {
    pub name: String,
    /// Replica URLs in failover order; index 0 is the preferred replica.
    pub replicas: Vec<String>,
}

/// APNs provider settings. One signing key serves all configured topics.
#[derive(Deserialize, Clone, Debug)]
pub struct ApnsSettings {
    pub keyid: String,
    pub teamid: String,
    pub privatekeypath: String,
    pub topics: Vec<ApnsTopicSettings>,
    /// VoIP QoS resend schedule.
    #[serde(default = "default_max_resend_count")]
    pub max_resend_count: u32,
    #[serde(default = "default_resend_delay_ms")]
    pub resend_delay_ms: u64,
}

/// One (apn type -> bundle id, environment) entry.
#[derive(Deserialize, Clone, Debug)]
pub struct ApnsTopicSettings {
    /// The `apnType` clients register with.
    pub apn_type: String,
    pub bundle_id: String,
    #[serde(default)]
    pub sandbox: bool,
}

fn default_max_resend_count() -> u32 {
    2
}

fn default_resend_delay_ms() -> u64 {
    5_000
}

#[derive(Debug, Deserialize, Clone)]
pub struct FcmSettings {
    /// The path to the service account key file.
    pub path: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct UmengSettings {
    pub app_key: String,
    pub app_master_secret: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct PushSettings {
    /// Worker tasks per push service.
    #[serde(default = "default_push_concurrency")]
    pub concurrency: usize,
}

impl Default for PushSettings {
    fn default() -> Self {
        Self {
            concurrency: default_push_concurrency(),
        }
    }
}

fn default_push_concurrency() -> usize {
    5
}

/// Offline orchestrator settings. The defaults match the production scan
/// cadence; tests dial them down.
#[derive(Debug, Deserialize, Clone)]
pub struct OfflineSettings {
    #[serde(default = "default_lease_ttl_secs")]
    pub lease_ttl_secs: u64,
    #[serde(default = "default_lease_renew_secs")]
    pub lease_renew_secs: u64,
    #[serde(default = "default_scan_interval_ms")]
    pub scan_interval_ms: u64,
    /// Triples younger than this stay invisible to the scan.
    #[serde(default = "default_message_delay_secs")]
    pub message_delay_secs: u64,
    /// Triples older than this are dropped unprocessed.
    #[serde(default = "default_message_expire_secs")]
    pub message_expire_secs: u64,
    /// Max triples fetched per partition per round.
    #[serde(default = "default_scan_limit")]
    pub scan_limit: usize,
    /// Fields per HSCAN step over the per-group user hash.
    #[serde(default = "default_user_scan_page")]
    pub user_scan_page: usize,
}

impl Default for OfflineSettings {
    fn default() -> Self {
        Self {
            lease_ttl_secs: default_lease_ttl_secs(),
            lease_renew_secs: default_lease_renew_secs(),
            scan_interval_ms: default_scan_interval_ms(),
            message_delay_secs: default_message_delay_secs(),
            message_expire_secs: default_message_expire_secs(),
            scan_limit: default_scan_limit(),
            user_scan_page: default_user_scan_page(),
        }
    }
}

fn default_lease_ttl_secs() -> u64 {
    30
}

fn default_lease_renew_secs() -> u64 {
    10
}

fn default_scan_interval_ms() -> u64 {
    1_000
}

fn default_message_delay_secs() -> u64 {
    5
}

fn default_message_expire_secs() -> u64 {
    30 * 60
}

fn default_scan_limit() -> usize {
    300
}

fn default_user_scan_page() -> usize {
    100
}

#[derive(Debug, Deserialize, Clone)]
pub struct GroupSettings {
    /// Upper bound on the ciphertext size of one group message.
    #[serde(default = "default_message_size_limit")]
    pub message_size_limit: usize,
    /// When true, `from_uid` is stored in cleartext; when false it is
    /// blanked and the sealed sender envelope carries the identity.
    #[serde(default)]
    pub plain_uid_support: bool,
}

impl Default for GroupSettings {
    fn default() -> Self {
        Self {
            message_size_limit: default_message_size_limit(),
            plain_uid_support: false,
        }
    }
}

fn default_message_size_limit() -> usize {
    4 * 1024
}

#[derive(Debug, Deserialize, Clone)]
pub struct AccountSettings {
    #[serde(default = "default_challenge_difficulty")]
    pub challenge_difficulty: u32,
    #[serde(default = "default_challenge_ttl_secs")]
    pub challenge_ttl_secs: u64,
}

impl Default for AccountSettings {
    fn default() -> Self {
        Self {
            challenge_difficulty: default_challenge_difficulty(),
            challenge_ttl_secs: default_challenge_ttl_secs(),
        }
    }
}

fn default_challenge_difficulty() -> u32 {
    16
}

fn default_challenge_ttl_secs() -> u64 {
    300
}

#[derive(Debug, Deserialize, Clone)]
pub struct MetricsSettings {
    pub dir: String,
    /// Five-character client id encoded into metrics file names.
    pub client_id: String,
    #[serde(default = "default_report_interval_ms")]
    pub report_interval_ms: u64,
    #[serde(default = "default_metrics_file_size")]
    pub file_size_bytes: u64,
    #[serde(default = "default_metrics_file_count")]
    pub file_count: usize,
    #[serde(default = "default_write_threshold_bytes")]
    pub write_threshold_bytes: i64,
}

fn default_report_interval_ms() -> u64 {
    60_000
}

fn default_metrics_file_size() -> u64 {
    64 * 1024 * 1024
}

fn default_metrics_file_count() -> usize {
    10
}

fn default_write_threshold_bytes() -> i64 {
    10 * 1024 * 1024
}
