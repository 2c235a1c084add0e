//! Command-line flag rendering for daemon configurations.
//!
//! Each configuration type knows its own flags and writes them through a
//! [`FlagWriter`]. The rendered list is sorted, so declaration order never
//! changes the output.

use anyhow::{Result, bail};
use regex::Regex;
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::LazyLock;
use std::time::Duration;

static QUANTITY_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[+-]?(\d+(\.\d*)?|\.\d+)([eE][+-]?\d+|[KMGTPE]i|[numkMGTPE])?$")
        .unwrap_or_else(|e| panic!("invalid quantity pattern: {e}"))
});

/// A resource quantity such as `100m`, `1.5`, or `2Gi`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Quantity(pub String);

impl Quantity {
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    pub fn is_valid(&self) -> bool {
        QUANTITY_RE.is_match(&self.0)
    }
}

impl fmt::Display for Quantity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Collects `--name=value` tokens.
#[derive(Debug, Default)]
pub struct FlagWriter {
    flags: Vec<String>,
    errors: Vec<String>,
}

impl FlagWriter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start a flag. Nothing is written until a value method is called.
    pub fn flag<'a>(&'a mut self, name: &'a str) -> Flag<'a> {
        Flag {
            out: self,
            name,
            repeat: false,
            empty: "",
            include_empty: false,
        }
    }

    /// The sorted flags, or every error seen while writing.
    pub fn finish(self) -> Result<Vec<String>> {
        if !self.errors.is_empty() {
            bail!("invalid flag values: {}", self.errors.join("; "));
        }
        let mut flags = self.flags;
        flags.sort();
        Ok(flags)
    }
}

/// A single flag being written.
pub struct Flag<'a> {
    out: &'a mut FlagWriter,
    name: &'a str,
    repeat: bool,
    empty: &'static str,
    include_empty: bool,
}

impl Flag<'_> {
    /// Write list values as one flag per item.
    #[must_use]
    pub fn repeat(mut self) -> Self {
        self.repeat = true;
        self
    }

    /// Suppress the flag when its value renders as `sentinel`.
    #[must_use]
    pub fn empty(mut self, sentinel: &'static str) -> Self {
        self.empty = sentinel;
        self
    }

    /// Write the flag even when the value is the empty string.
    #[must_use]
    pub fn include_empty(mut self) -> Self {
        self.include_empty = true;
        self
    }

    fn accepts(&self, value: &str) -> bool {
        let suppressed = value.is_empty() || value == self.empty;
        !suppressed || self.include_empty
    }

    fn emit(self, value: String) {
        if self.accepts(&value) {
            self.out.flags.push(format!("--{}={value}", self.name));
        }
    }

    pub fn str(self, value: &str) {
        self.emit(value.to_string());
    }

    pub fn str_opt(self, value: Option<&String>) {
        if let Some(v) = value {
            self.emit(v.clone());
        }
    }

    pub fn bool(self, value: bool) {
        self.emit(value.to_string());
    }

    pub fn bool_opt(self, value: Option<bool>) {
        if let Some(v) = value {
            self.bool(v);
        }
    }

    pub fn int(self, value: impl Into<i64>) {
        self.emit(value.into().to_string());
    }

    pub fn int_opt<T: Into<i64> + Copy>(self, value: Option<T>) {
        if let Some(v) = value {
            self.int(v);
        }
    }

    pub fn float(self, value: f64) {
        self.emit(value.to_string());
    }

    pub fn duration(self, value: Duration) {
        self.emit(go_duration(value));
    }

    pub fn duration_opt(self, value: Option<Duration>) {
        if let Some(v) = value {
            self.duration(v);
        }
    }

    pub fn quantity(self, value: Option<&Quantity>) {
        let Some(q) = value else { return };
        if !q.is_valid() {
            self.out
                .errors
                .push(format!("--{}: {:?} is not a valid quantity", self.name, q.0));
            return;
        }
        self.emit(q.0.clone());
    }

    /// `k=v` pairs joined by commas, sorted by key.
    pub fn map(self, value: &BTreeMap<String, String>) {
        let joined = value
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<_>>()
            .join(",");
        self.emit(joined);
    }

    pub fn list(self, value: &[String]) {
        if !self.repeat {
            self.emit(value.join(","));
            return;
        }
        for item in value {
            if self.accepts(item) {
                self.out.flags.push(format!("--{}={item}", self.name));
            }
        }
    }
}

/// A configuration that renders itself as command-line flags.
pub trait WriteFlags {
    fn write_flags(&self, out: &mut FlagWriter);
}

pub fn build_flags(config: &impl WriteFlags) -> Result<Vec<String>> {
    let mut out = FlagWriter::new();
    config.write_flags(&mut out);
    out.finish()
}

/// Sorted flags joined by single spaces.
pub fn render_flags(config: &impl WriteFlags) -> Result<String> {
    Ok(build_flags(config)?.join(" "))
}

/// Format a duration the way Go's `time.Duration` prints.
pub fn go_duration(d: Duration) -> String {
    let nanos = d.as_nanos();
    if nanos == 0 {
        return "0s".to_string();
    }
    if nanos < 1_000 {
        return format!("{nanos}ns");
    }
    if nanos < 1_000_000 {
        return format!("{}µs", fraction(nanos, 1_000, 3));
    }
    if nanos < 1_000_000_000 {
        return format!("{}ms", fraction(nanos, 1_000_000, 6));
    }

    let secs = d.as_secs();
    let hours = secs / 3600;
    let minutes = (secs / 60) % 60;
    let sub = u128::from(secs % 60) * 1_000_000_000 + u128::from(d.subsec_nanos());
    let seconds = fraction(sub, 1_000_000_000, 9);
    if hours > 0 {
        format!("{hours}h{minutes}m{seconds}s")
    } else if minutes > 0 {
        format!("{minutes}m{seconds}s")
    } else {
        format!("{seconds}s")
    }
}

fn fraction(value: u128, unit: u128, width: usize) -> String {
    let whole = value / unit;
    let rem = value % unit;
    if rem == 0 {
        return whole.to_string();
    }
    let digits = format!("{rem:0width$}");
    format!("{whole}.{}", digits.trim_end_matches('0'))
}

/// Parse Go duration syntax: `120s`, `2m0s`, `1.5h`, `300ms`.
pub fn parse_go_duration(s: &str) -> Result<Duration> {
    let s = s.trim();
    if s == "0" {
        return Ok(Duration::ZERO);
    }
    if s.is_empty() {
        bail!("empty duration");
    }

    let mut total = 0f64;
    let mut rest = s;
    while !rest.is_empty() {
        let num_len = rest
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .unwrap_or(rest.len());
        if num_len == 0 {
            bail!("invalid duration {s:?}");
        }
        let number: f64 = rest[..num_len]
            .parse()
            .map_err(|_| anyhow::anyhow!("invalid duration {s:?}"))?;
        rest = &rest[num_len..];

        let unit_len = rest
            .find(|c: char| c.is_ascii_digit() || c == '.')
            .unwrap_or(rest.len());
        let scale = match &rest[..unit_len] {
            "ns" => 1.0,
            "us" | "µs" => 1e3,
            "ms" => 1e6,
            "s" => 1e9,
            "m" => 60e9,
            "h" => 3600e9,
            unit => bail!("unknown unit {unit:?} in duration {s:?}"),
        };
        rest = &rest[unit_len..];
        total += number * scale;
    }

    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    let nanos = total.round() as u64;
    Ok(Duration::from_nanos(nanos))
}

/// Deserialize an optional Go-style duration string.
pub fn deserialize_duration_opt<'de, D>(deserializer: D) -> std::result::Result<Option<Duration>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw: Option<String> = Option::deserialize(deserializer)?;
    raw.map(|s| parse_go_duration(&s).map_err(serde::de::Error::custom))
        .transpose()
}

/// API server flags.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct KubeApiServerConfig {
    pub insecure_port: i32,
    pub secure_port: i32,
    pub log_level: i32,
    pub max_requests_inflight: i32,
    pub bind_address: Option<String>,
    pub insecure_bind_address: Option<String>,
    pub etcd_servers: Vec<String>,
    pub etcd_servers_overrides: Vec<String>,
    pub enable_admission_plugins: Vec<String>,
    pub service_account_key_file: Vec<String>,
    pub service_cluster_ip_range: Option<String>,
    pub allow_privileged: Option<bool>,
    pub anonymous_auth: Option<bool>,
    pub authorization_mode: Option<String>,
    pub client_ca_file: Option<String>,
    pub tls_cert_file: Option<String>,
    pub tls_private_key_file: Option<String>,
    pub cloud_provider: Option<String>,
    pub apiserver_count: Option<i32>,
    pub feature_gates: BTreeMap<String, String>,
    pub runtime_config: BTreeMap<String, String>,
    #[serde(deserialize_with = "deserialize_duration_opt")]
    pub audit_webhook_initial_backoff: Option<Duration>,
    #[serde(deserialize_with = "deserialize_duration_opt")]
    pub audit_webhook_batch_max_wait: Option<Duration>,
}

impl WriteFlags for KubeApiServerConfig {
    fn write_flags(&self, out: &mut FlagWriter) {
        out.flag("insecure-port").int(self.insecure_port);
        out.flag("secure-port").int(self.secure_port);
        out.flag("v").empty("0").int(self.log_level);
        out.flag("max-requests-inflight").empty("0").int(self.max_requests_inflight);
        out.flag("bind-address").str_opt(self.bind_address.as_ref());
        out.flag("insecure-bind-address").str_opt(self.insecure_bind_address.as_ref());
        out.flag("etcd-servers").list(&self.etcd_servers);
        out.flag("etcd-servers-overrides").list(&self.etcd_servers_overrides);
        out.flag("enable-admission-plugins").list(&self.enable_admission_plugins);
        out.flag("service-account-key-file").repeat().list(&self.service_account_key_file);
        out.flag("service-cluster-ip-range").str_opt(self.service_cluster_ip_range.as_ref());
        out.flag("allow-privileged").bool_opt(self.allow_privileged);
        out.flag("anonymous-auth").bool_opt(self.anonymous_auth);
        out.flag("authorization-mode").str_opt(self.authorization_mode.as_ref());
        out.flag("client-ca-file").str_opt(self.client_ca_file.as_ref());
        out.flag("tls-cert-file").str_opt(self.tls_cert_file.as_ref());
        out.flag("tls-private-key-file").str_opt(self.tls_private_key_file.as_ref());
        out.flag("cloud-provider").str_opt(self.cloud_provider.as_ref());
        out.flag("apiserver-count").int_opt(self.apiserver_count);
        out.flag("feature-gates").map(&self.feature_gates);
        out.flag("runtime-config").map(&self.runtime_config);
        out.flag("audit-webhook-initial-backoff").duration_opt(self.audit_webhook_initial_backoff);
        out.flag("audit-webhook-batch-max-wait").duration_opt(self.audit_webhook_batch_max_wait);
    }
}

/// Kubelet flags.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct KubeletConfig {
    pub log_level: i32,
    pub pod_manifest_path: Option<String>,
    pub hostname_override: Option<String>,
    pub allow_privileged: Option<bool>,
    pub cluster_dns: Option<String>,
    pub cluster_domain: Option<String>,
    pub network_plugin_name: Option<String>,
    pub cloud_provider: Option<String>,
    pub kubeconfig_path: Option<String>,
    pub register_schedulable: Option<bool>,
    pub node_labels: BTreeMap<String, String>,
    pub feature_gates: BTreeMap<String, String>,
    pub max_pods: Option<i32>,
    pub eviction_hard: Option<String>,
    #[serde(deserialize_with = "deserialize_duration_opt")]
    pub runtime_request_timeout: Option<Duration>,
    #[serde(deserialize_with = "deserialize_duration_opt")]
    pub volume_stats_agg_period: Option<Duration>,
    pub kube_api_qps: Option<Quantity>,
    pub client_ca_file: Option<String>,
    pub tls_cert_file: Option<String>,
    pub tls_private_key_file: Option<String>,
    pub cgroup_root: Option<String>,
    pub non_masquerade_cidr: Option<String>,
    pub root_dir: Option<String>,
    pub taints: Vec<String>,
}

impl WriteFlags for KubeletConfig {
    fn write_flags(&self, out: &mut FlagWriter) {
        out.flag("v").empty("0").int(self.log_level);
        out.flag("pod-manifest-path").str_opt(self.pod_manifest_path.as_ref());
        out.flag("hostname-override").str_opt(self.hostname_override.as_ref());
        out.flag("allow-privileged").bool_opt(self.allow_privileged);
        out.flag("cluster-dns").str_opt(self.cluster_dns.as_ref());
        out.flag("cluster-domain").str_opt(self.cluster_domain.as_ref());
        out.flag("network-plugin").str_opt(self.network_plugin_name.as_ref());
        out.flag("cloud-provider").str_opt(self.cloud_provider.as_ref());
        out.flag("kubeconfig").str_opt(self.kubeconfig_path.as_ref());
        out.flag("register-schedulable").bool_opt(self.register_schedulable);
        out.flag("node-labels").map(&self.node_labels);
        out.flag("feature-gates").map(&self.feature_gates);
        out.flag("max-pods").int_opt(self.max_pods);
        out.flag("eviction-hard").str_opt(self.eviction_hard.as_ref());
        out.flag("runtime-request-timeout").duration_opt(self.runtime_request_timeout);
        out.flag("volume-stats-agg-period").duration_opt(self.volume_stats_agg_period);
        out.flag("kube-api-qps").quantity(self.kube_api_qps.as_ref());
        out.flag("client-ca-file").str_opt(self.client_ca_file.as_ref());
        out.flag("tls-cert-file").str_opt(self.tls_cert_file.as_ref());
        out.flag("tls-private-key-file").str_opt(self.tls_private_key_file.as_ref());
        out.flag("cgroup-root").str_opt(self.cgroup_root.as_ref());
        out.flag("non-masquerade-cidr").str_opt(self.non_masquerade_cidr.as_ref());
        out.flag("root-dir").str_opt(self.root_dir.as_ref());
        out.flag("register-with-taints").list(&self.taints);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_apiserver_defaults() {
        let config = KubeApiServerConfig::default();
        assert_eq!(render_flags(&config).unwrap(), "--insecure-port=0 --secure-port=0");
    }

    #[test]
    fn test_apiserver_duration_sorts_first() {
        let config = KubeApiServerConfig {
            audit_webhook_initial_backoff: Some(Duration::from_secs(120)),
            ..Default::default()
        };
        assert_eq!(
            render_flags(&config).unwrap(),
            "--audit-webhook-initial-backoff=2m0s --insecure-port=0 --secure-port=0"
        );
    }

    #[test]
    fn test_sentinel_and_include_empty() {
        let mut out = FlagWriter::new();
        out.flag("v").empty("0").int(0);
        out.flag("a").str("");
        out.flag("b").include_empty().str("");
        out.flag("c").empty("none").str("none");
        out.flag("d").empty("none").str("some");
        assert_eq!(out.finish().unwrap(), vec!["--b=", "--d=some"]);
    }

    #[test]
    fn test_maps_and_lists() {
        let mut gates = BTreeMap::new();
        gates.insert("Zeta".to_string(), "true".to_string());
        gates.insert("Alpha".to_string(), "false".to_string());
        let config = KubeApiServerConfig {
            feature_gates: gates,
            etcd_servers: vec!["http://a:4001".into(), "http://b:4001".into()],
            service_account_key_file: vec!["/srv/b.key".into(), "/srv/a.key".into()],
            ..Default::default()
        };
        let flags = build_flags(&config).unwrap();
        assert!(flags.contains(&"--feature-gates=Alpha=false,Zeta=true".to_string()));
        assert!(flags.contains(&"--etcd-servers=http://a:4001,http://b:4001".to_string()));
        assert!(flags.contains(&"--service-account-key-file=/srv/a.key".to_string()));
        assert!(flags.contains(&"--service-account-key-file=/srv/b.key".to_string()));
        let mut sorted = flags.clone();
        sorted.sort();
        assert_eq!(flags, sorted);
    }

    #[test]
    fn test_float_and_int() {
        let mut out = FlagWriter::new();
        out.flag("ratio").float(0.75);
        out.flag("port").int(443);
        out.flag("zero").empty("0").float(0.0);
        assert_eq!(out.finish().unwrap(), vec!["--port=443", "--ratio=0.75"]);
    }

    #[test]
    fn test_quantity_validation() {
        let ok = KubeletConfig {
            kube_api_qps: Some(Quantity::new("1.5")),
            ..Default::default()
        };
        assert_eq!(render_flags(&ok).unwrap(), "--kube-api-qps=1.5");

        let bad = KubeletConfig {
            kube_api_qps: Some(Quantity::new("fast")),
            ..Default::default()
        };
        assert!(render_flags(&bad).is_err());
        assert!(Quantity::new("2Gi").is_valid());
        assert!(Quantity::new("100m").is_valid());
    }

    #[test]
    fn test_go_duration() {
        assert_eq!(go_duration(Duration::ZERO), "0s");
        assert_eq!(go_duration(Duration::from_secs(120)), "2m0s");
        assert_eq!(go_duration(Duration::from_secs(3600)), "1h0m0s");
        assert_eq!(go_duration(Duration::from_millis(1500)), "1.5s");
        assert_eq!(go_duration(Duration::from_millis(300)), "300ms");
        assert_eq!(go_duration(Duration::from_micros(1500)), "1.5ms");
        assert_eq!(go_duration(Duration::from_nanos(42)), "42ns");
        assert_eq!(go_duration(Duration::from_secs(3725)), "1h2m5s");
    }

    #[test]
    fn test_parse_go_duration() {
        assert_eq!(parse_go_duration("120s").unwrap(), Duration::from_secs(120));
        assert_eq!(parse_go_duration("2m0s").unwrap(), Duration::from_secs(120));
        assert_eq!(parse_go_duration("1.5s").unwrap(), Duration::from_millis(1500));
        assert_eq!(parse_go_duration("0").unwrap(), Duration::ZERO);
        assert!(parse_go_duration("5 minutes").is_err());
        assert!(parse_go_duration("").is_err());
    }

    #[test]
    fn test_deserialize_from_toml() {
        let config: KubeApiServerConfig =
            toml::from_str("secure_port = 443\naudit_webhook_initial_backoff = \"10s\"\n").unwrap();
        assert_eq!(config.secure_port, 443);
        assert_eq!(config.audit_webhook_initial_backoff, Some(Duration::from_secs(10)));
    }
}
