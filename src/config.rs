//! Declarative engine configuration, loaded once from a TOML document.
//!
//! ```toml
//! input_sources = ["pcapint:eth0"]
//! pkt_threads = 4
//! iptracker_threads = 8
//! limitmetrics = ["basic", "tcpports", "ipinfo", "pfx2asn"]
//! tcp_dest_port_range = ["0-1023", "8080"]
//! geo_mode = "full"
//! output_row_label = "telescope-east"
//!
//! [source_ip_counting]
//! method = "sample"
//! subnetmask = 24
//! ```

use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::report::policy::GeoMode;
use crate::report::{MAX_PKT_WORKERS, MAX_SHARDS};
use crate::{ReportError, ReportResult};

pub use crate::report::policy::IpCountMethod;

/// Unique-IP counting configuration for one address role.
#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct IpCountingConfig {
    /// Counting method: `none`, `sample` or `prefixagg`.
    pub method: IpCountMethod,
    /// Prefix width in bits; out-of-range values fall back to 32.
    pub subnetmask: u8,
}

impl Default for IpCountingConfig {
    fn default() -> Self {
        Self {
            method: IpCountMethod::All,
            subnetmask: 32,
        }
    }
}

/// Which external consumer receives the merged result rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    /// Columnar record writer.
    Avro,
    /// Time-series push.
    Timeseries,
}

/// The engine configuration.
///
/// Field names match the configuration keys accepted in the TOML document.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Capture URIs consumed by the front-end; opaque to the engine but at
    /// least one must be present.
    pub input_sources: Vec<String>,
    /// Number of capture workers.
    pub pkt_threads: usize,
    /// Number of shard tally workers.
    pub iptracker_threads: usize,
    /// Per-producer queue high-water mark, in messages.
    pub internalhwm: usize,
    /// Downsample factor applied by the front-end before tagging.
    pub sample_rate: u32,
    /// Enabled metric-class groups; empty means all.
    pub limitmetrics: Vec<String>,
    /// Allowed TCP source ports, as inclusive ranges.
    pub tcp_source_port_range: Vec<String>,
    /// Allowed TCP destination ports, as inclusive ranges.
    pub tcp_dest_port_range: Vec<String>,
    /// Allowed UDP source ports, as inclusive ranges.
    pub udp_source_port_range: Vec<String>,
    /// Allowed UDP destination ports, as inclusive ranges.
    pub udp_dest_port_range: Vec<String>,
    /// Unique-IP counting for source addresses.
    pub source_ip_counting: IpCountingConfig,
    /// Unique-IP counting for destination addresses.
    pub dest_ip_counting: IpCountingConfig,
    /// Level of detail for geo-tagged series.
    pub geo_mode: GeoMode,
    /// Optional (geo, ASN) couplet whitelist file.
    pub geoasn_whitelist_file: Option<PathBuf>,
    /// Label copied into every result row.
    pub output_row_label: Option<String>,
    /// Which external consumer receives the rows.
    pub output_format: OutputFormat,
    /// Whether the merge collector queries the tagger for human-readable
    /// region and polygon labels.
    pub querytaggerlabels: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            input_sources: Vec::new(),
            pkt_threads: 2,
            iptracker_threads: 4,
            internalhwm: 30,
            sample_rate: 1,
            limitmetrics: Vec::new(),
            tcp_source_port_range: Vec::new(),
            tcp_dest_port_range: Vec::new(),
            udp_source_port_range: Vec::new(),
            udp_dest_port_range: Vec::new(),
            source_ip_counting: IpCountingConfig::default(),
            dest_ip_counting: IpCountingConfig::default(),
            geo_mode: GeoMode::Full,
            geoasn_whitelist_file: None,
            output_row_label: None,
            output_format: OutputFormat::Avro,
            querytaggerlabels: true,
        }
    }
}

impl Config {
    /// Parses a configuration document.
    ///
    /// # Errors
    /// Returns an error when the document is not valid TOML or contains
    /// unknown keys.
    pub fn from_toml(text: &str) -> ReportResult<Self> {
        Ok(toml::from_str(text)?)
    }

    /// Loads and parses a configuration file.
    ///
    /// # Errors
    /// Returns an error when the file cannot be read or parsed.
    pub fn from_file<P: AsRef<Path>>(path: P) -> ReportResult<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).map_err(|err| {
            ReportError::Config(format!("unable to read '{}': {err}", path.display()))
        })?;
        Self::from_toml(&text)
    }

    /// Checks the invariants the engine depends on.
    ///
    /// # Errors
    /// Returns an error when no capture source is configured or a thread
    /// count is out of range.
    pub fn validate(&self) -> ReportResult<()> {
        if self.input_sources.is_empty() {
            return Err(ReportError::Config(
                "no capture sources configured".to_string(),
            ));
        }
        if self.pkt_threads == 0 || self.pkt_threads > MAX_PKT_WORKERS {
            return Err(ReportError::Config(format!(
                "pkt_threads must be between 1 and {MAX_PKT_WORKERS}"
            )));
        }
        if self.iptracker_threads == 0 || self.iptracker_threads > MAX_SHARDS {
            return Err(ReportError::Config(format!(
                "iptracker_threads must be between 1 and {MAX_SHARDS}"
            )));
        }
        if self.sample_rate == 0 {
            return Err(ReportError::Config(
                "sample_rate must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.pkt_threads, 2);
        assert_eq!(config.iptracker_threads, 4);
        assert_eq!(config.internalhwm, 30);
        assert_eq!(config.geo_mode, GeoMode::Full);
        assert_eq!(config.output_format, OutputFormat::Avro);
        assert!(config.querytaggerlabels);
    }

    #[test]
    fn test_full_document() {
        let config = Config::from_toml(
            r#"
            input_sources = ["pcapint:eth0", "pcapint:eth1"]
            pkt_threads = 4
            iptracker_threads = 8
            internalhwm = 50
            sample_rate = 4
            limitmetrics = ["basic", "tcpports"]
            tcp_dest_port_range = ["0-1023", "8080"]
            geo_mode = "lite"
            output_row_label = "telescope-east"
            output_format = "timeseries"
            querytaggerlabels = false
            geoasn_whitelist_file = "/etc/telescope/geoasn.list"

            [source_ip_counting]
            method = "sample"
            subnetmask = 24

            [dest_ip_counting]
            method = "prefixagg"
            subnetmask = 16
            "#,
        )
        .unwrap();
        assert_eq!(config.input_sources.len(), 2);
        assert_eq!(config.pkt_threads, 4);
        assert_eq!(config.iptracker_threads, 8);
        assert_eq!(config.geo_mode, GeoMode::Lite);
        assert_eq!(config.output_format, OutputFormat::Timeseries);
        assert_eq!(config.source_ip_counting.method, IpCountMethod::Sample);
        assert_eq!(config.source_ip_counting.subnetmask, 24);
        assert_eq!(config.dest_ip_counting.method, IpCountMethod::PrefixAgg);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_unknown_keys_rejected() {
        assert!(Config::from_toml("bogus_option = 1").is_err());
    }

    #[test]
    fn test_validation_failures() {
        let mut config = Config::default();
        assert!(config.validate().is_err());

        config.input_sources.push("pcapint:eth0".to_string());
        assert!(config.validate().is_ok());

        config.iptracker_threads = 33;
        assert!(config.validate().is_err());
        config.iptracker_threads = 4;

        config.pkt_threads = 0;
        assert!(config.validate().is_err());
        config.pkt_threads = 2;

        config.sample_rate = 0;
        assert!(config.validate().is_err());
    }
}
