//! The metric policy: which cells a tagged packet contributes to.
//!
//! The policy is configured once at startup and immutable thereafter. It is
//! applied on the capture-worker side when the batcher constructs a tag
//! list; the shard tally workers trust the metric IDs they receive.

use std::fs;
use std::path::Path;

use hashbrown::HashSet;
use serde::Deserialize;
use tracing::{info, warn};

use super::metrics::{
    pack_geo_code, MetricClass, MetricId, MetricTag, MAX_ASSOCIATED_METRICS,
};
use super::TagRecord;
use crate::config::Config;
use crate::{ReportError, ReportResult};

/// Upper bound on the number of tags attached to a single IP observation.
pub const MAX_TAGS_PER_PACKET: usize = 32;

const IPPROTO_ICMP: u8 = 1;
const IPPROTO_TCP: u8 = 6;
const IPPROTO_UDP: u8 = 17;

/// Level of detail for geo-tagged series.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GeoMode {
    /// Continents, countries, regions and polygons.
    Full,
    /// Continents and countries only.
    Lite,
}

/// How unique "IPs" are counted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub enum IpCountMethod {
    /// Every distinct address counts.
    #[serde(rename = "none")]
    All,
    /// Only one deterministic representative per prefix counts.
    #[serde(rename = "sample")]
    Sample,
    /// Addresses are collapsed to their prefix before counting.
    #[serde(rename = "prefixagg")]
    PrefixAgg,
}

/// Unique-IP counting configuration for one address role.
#[derive(Debug, Clone, Copy)]
pub struct IpCountPolicy {
    /// The counting method.
    pub method: IpCountMethod,
    /// Prefix width for the sample and prefix-aggregation methods.
    pub prefix_bits: u8,
}

impl Default for IpCountPolicy {
    fn default() -> Self {
        Self {
            method: IpCountMethod::All,
            prefix_bits: 32,
        }
    }
}

impl IpCountPolicy {
    /// Network mask selecting the prefix bits of an address.
    #[must_use]
    pub(crate) const fn prefix_mask(self) -> u32 {
        if self.prefix_bits >= 32 {
            u32::MAX
        } else {
            !(u32::MAX >> self.prefix_bits)
        }
    }

    /// The representative suffix for the sample method, derived
    /// deterministically so every capture worker and both address legs
    /// agree on which 1-of-2^(32-k) addresses stand in for a prefix.
    #[must_use]
    pub(crate) const fn sample_index(self, shard: usize, is_src: bool) -> u32 {
        let mask = self.prefix_mask();
        if mask == u32::MAX {
            return 0;
        }
        // FNV-1a over the shard index and role byte.
        let mut h: u64 = 0xcbf2_9ce4_8422_2325;
        let mut input = ((shard as u64) << 1) | is_src as u64;
        let mut i = 0;
        while i < 8 {
            h ^= input & 0xff;
            h = h.wrapping_mul(0x0000_0100_0000_01b3);
            input >>= 8;
            i += 1;
        }
        (h as u32) & !mask
    }
}

/// A 65 536-bit allow-set of ports.
#[derive(Clone)]
pub struct PortBitmap {
    bits: Box<[u8; 8192]>,
}

impl std::fmt::Debug for PortBitmap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let set: usize = self.bits.iter().map(|b| b.count_ones() as usize).sum();
        write!(f, "PortBitmap({set} ports)")
    }
}

impl PortBitmap {
    /// A bitmap with every port allowed.
    #[must_use]
    pub fn all() -> Self {
        Self {
            bits: Box::new([0xff; 8192]),
        }
    }

    /// A bitmap with no port allowed.
    #[must_use]
    pub fn none() -> Self {
        Self {
            bits: Box::new([0; 8192]),
        }
    }

    /// Allows every port in the inclusive range.
    pub fn set_range(&mut self, first: u16, last: u16) {
        for port in first..=last {
            self.bits[usize::from(port) >> 3] |= 1 << (port & 7);
        }
    }

    /// Whether the port is allowed.
    #[must_use]
    pub fn contains(&self, port: u16) -> bool {
        self.bits[usize::from(port) >> 3] & (1 << (port & 7)) != 0
    }
}

impl Default for PortBitmap {
    fn default() -> Self {
        Self::all()
    }
}

/// The set of (geo, ASN) couplets for which coupled cells are accrued.
#[derive(Debug, Clone, Default)]
pub struct GeoAsnWhitelist {
    couplets: HashSet<u64>,
}

impl GeoAsnWhitelist {
    /// Parses a whitelist document: one `<geo> <asn>` couplet per line,
    /// where `<geo>` is a two-letter code or a decimal region identifier.
    /// Blank lines and `#` comments are skipped; malformed lines are
    /// logged and ignored.
    #[must_use]
    pub fn parse(text: &str) -> Self {
        let mut couplets = HashSet::new();
        for (lineno, line) in text.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let mut fields = line.split_whitespace();
            let geo = fields.next().and_then(parse_geo_token);
            let asn = fields.next().and_then(|tok| tok.parse::<u32>().ok());
            match (geo, asn) {
                (Some(geo), Some(asn)) => {
                    couplets.insert((u64::from(geo) << 32) | u64::from(asn));
                }
                _ => {
                    warn!(line = lineno + 1, "ignoring malformed geoasn whitelist entry");
                }
            }
        }
        Self { couplets }
    }

    /// Loads and parses a whitelist file.
    ///
    /// # Errors
    /// Returns an error when the file cannot be read.
    pub fn from_file(path: &Path) -> ReportResult<Self> {
        let text = fs::read_to_string(path).map_err(|err| {
            ReportError::Config(format!(
                "unable to read geoasn whitelist '{}': {err}",
                path.display()
            ))
        })?;
        let list = Self::parse(&text);
        info!(
            couplets = list.couplets.len(),
            file = %path.display(),
            "loaded geoasn whitelist"
        );
        Ok(list)
    }

    /// Whether the couplet is whitelisted.
    #[must_use]
    pub fn allows(&self, geo_code: u32, asn: u32) -> bool {
        self.couplets
            .contains(&((u64::from(geo_code) << 32) | u64::from(asn)))
    }

    /// Number of couplets in the whitelist.
    #[must_use]
    pub fn len(&self) -> usize {
        self.couplets.len()
    }

    /// Whether the whitelist is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.couplets.is_empty()
    }
}

fn parse_geo_token(tok: &str) -> Option<u32> {
    let bytes = tok.as_bytes();
    if bytes.len() == 2 && bytes.iter().all(u8::is_ascii_alphabetic) {
        return Some(u32::from(pack_geo_code([bytes[0], bytes[1]])));
    }
    tok.parse::<u32>().ok()
}

/// Parses a port range string, `"80"` or `"1024-2048"`.
///
/// The first port must be a valid port number; the last saturates at
/// 65 535, mirroring how open-ended ranges are conventionally written.
#[must_use]
pub fn parse_port_range(range: &str) -> Option<(u16, u16)> {
    let range = range.trim();
    let (first, last) = match range.split_once('-') {
        Some((first, last)) => {
            let first = first.trim().parse::<u32>().ok()?;
            let last = last.trim().parse::<u32>().ok()?.min(65_535);
            (first, last)
        }
        None => {
            let port = range.parse::<u32>().ok()?;
            (port, port)
        }
    };
    if first > 65_535 || last < first {
        return None;
    }
    #[allow(clippy::cast_possible_truncation)]
    Some((first as u16, last as u16))
}

/// The immutable metric policy.
#[derive(Debug, Clone)]
pub struct ReportPolicy {
    /// Enabled metric classes; 0 means all.
    enabled: u64,
    tcp_src_ports: PortBitmap,
    tcp_dst_ports: PortBitmap,
    udp_src_ports: PortBitmap,
    udp_dst_ports: PortBitmap,
    geo_mode: GeoMode,
    pub(crate) src_ip_count: IpCountPolicy,
    pub(crate) dst_ip_count: IpCountPolicy,
    geoasn_whitelist: Option<GeoAsnWhitelist>,
}

impl Default for ReportPolicy {
    fn default() -> Self {
        Self {
            enabled: 0,
            tcp_src_ports: PortBitmap::all(),
            tcp_dst_ports: PortBitmap::all(),
            udp_src_ports: PortBitmap::all(),
            udp_dst_ports: PortBitmap::all(),
            geo_mode: GeoMode::Full,
            src_ip_count: IpCountPolicy::default(),
            dst_ip_count: IpCountPolicy::default(),
            geoasn_whitelist: None,
        }
    }
}

impl ReportPolicy {
    /// Builds the policy from a validated configuration.
    ///
    /// # Errors
    /// Returns an error when the geoasn whitelist file cannot be read.
    pub fn from_config(config: &Config) -> ReportResult<Self> {
        let mut policy = Self {
            geo_mode: config.geo_mode,
            src_ip_count: ip_count_policy(
                config.source_ip_counting.method,
                config.source_ip_counting.subnetmask,
                "source",
            ),
            dst_ip_count: ip_count_policy(
                config.dest_ip_counting.method,
                config.dest_ip_counting.subnetmask,
                "dest",
            ),
            ..Self::default()
        };

        for name in &config.limitmetrics {
            if !policy.enable_group(name) {
                warn!(group = %name, "unknown limitmetrics group, ignoring");
            }
        }

        policy.tcp_src_ports = build_port_bitmap(&config.tcp_source_port_range);
        policy.tcp_dst_ports = build_port_bitmap(&config.tcp_dest_port_range);
        policy.udp_src_ports = build_port_bitmap(&config.udp_source_port_range);
        policy.udp_dst_ports = build_port_bitmap(&config.udp_dest_port_range);

        if let Some(path) = &config.geoasn_whitelist_file {
            policy.geoasn_whitelist = Some(GeoAsnWhitelist::from_file(path)?);
        }

        Ok(policy)
    }

    /// Enables the metric classes belonging to a named configuration group.
    /// Returns false if the group name is unknown.
    pub fn enable_group(&mut self, name: &str) -> bool {
        let mask = match name.to_ascii_lowercase().as_str() {
            "basic" => MetricClass::Combined.bit() | MetricClass::IpProtocol.bit(),
            "tcpports" => MetricClass::TcpSourcePort.bit() | MetricClass::TcpDestPort.bit(),
            "udpports" => MetricClass::UdpSourcePort.bit() | MetricClass::UdpDestPort.bit(),
            "icmp" => MetricClass::IcmpTypeCode.bit(),
            "netacq" => {
                MetricClass::NetacqContinent.bit()
                    | MetricClass::NetacqCountry.bit()
                    | MetricClass::NetacqRegion.bit()
                    | MetricClass::NetacqPolygon.bit()
            }
            "maxmind" => MetricClass::MaxmindContinent.bit() | MetricClass::MaxmindCountry.bit(),
            "ipinfo" => {
                MetricClass::IpinfoContinent.bit()
                    | MetricClass::IpinfoCountry.bit()
                    | MetricClass::IpinfoRegion.bit()
            }
            "pfx2asn" => {
                MetricClass::PrefixAsn.bit()
                    | MetricClass::IpinfoCountryPrefixAsn.bit()
                    | MetricClass::IpinfoRegionPrefixAsn.bit()
            }
            "filter" => MetricClass::FilterCriteria.bit(),
            _ => return false,
        };
        self.enabled |= mask;
        true
    }

    /// Whether a metric class is enabled. `Combined` always is.
    #[must_use]
    pub fn class_enabled(&self, class: MetricClass) -> bool {
        class == MetricClass::Combined || self.enabled == 0 || self.enabled & class.bit() != 0
    }

    fn couplet_allowed(&self, geo_code: u32, asn: u32) -> bool {
        self.geoasn_whitelist
            .as_ref()
            .is_none_or(|list| list.allows(geo_code, asn))
    }

    /// Builds the list of metric cells a packet contributes to.
    ///
    /// The list applies to both address legs of the packet; the first tag
    /// is always `Combined`. A record with no providers contributes to
    /// `Combined` only.
    pub fn build_tag_list(&self, rec: &TagRecord, out: &mut Vec<MetricTag>) {
        out.clear();
        out.push(MetricTag::flat(MetricId::COMBINED));

        if rec.providers == 0 {
            return;
        }

        if self.class_enabled(MetricClass::IpProtocol) {
            push_flat(out, MetricClass::IpProtocol, u64::from(rec.protocol));
        }

        match rec.protocol {
            IPPROTO_ICMP => {
                if self.class_enabled(MetricClass::IcmpTypeCode) {
                    // The tagger stores the ICMP type and code in the port
                    // fields; fuse them into one flat 16-bit value.
                    let typecode = ((rec.src_port & 0xff) << 8) | (rec.dst_port & 0xff);
                    push_flat(out, MetricClass::IcmpTypeCode, u64::from(typecode));
                }
            }
            IPPROTO_TCP => {
                if self.class_enabled(MetricClass::TcpSourcePort)
                    && self.tcp_src_ports.contains(rec.src_port)
                {
                    push_flat(out, MetricClass::TcpSourcePort, u64::from(rec.src_port));
                }
                if self.class_enabled(MetricClass::TcpDestPort)
                    && self.tcp_dst_ports.contains(rec.dst_port)
                {
                    push_flat(out, MetricClass::TcpDestPort, u64::from(rec.dst_port));
                }
            }
            IPPROTO_UDP => {
                if self.class_enabled(MetricClass::UdpSourcePort)
                    && self.udp_src_ports.contains(rec.src_port)
                {
                    push_flat(out, MetricClass::UdpSourcePort, u64::from(rec.src_port));
                }
                if self.class_enabled(MetricClass::UdpDestPort)
                    && self.udp_dst_ports.contains(rec.dst_port)
                {
                    push_flat(out, MetricClass::UdpDestPort, u64::from(rec.dst_port));
                }
            }
            _ => {}
        }

        if rec.providers & super::providers::MAXMIND != 0 {
            if self.class_enabled(MetricClass::MaxmindContinent) {
                push_flat(out, MetricClass::MaxmindContinent, u64::from(rec.maxmind_continent));
            }
            if self.class_enabled(MetricClass::MaxmindCountry) {
                push_flat(out, MetricClass::MaxmindCountry, u64::from(rec.maxmind_country));
            }
        }

        if rec.providers & super::providers::NETACQ != 0 {
            if self.class_enabled(MetricClass::NetacqContinent) {
                push_flat(out, MetricClass::NetacqContinent, u64::from(rec.netacq_continent));
            }
            if self.class_enabled(MetricClass::NetacqCountry) {
                push_flat(out, MetricClass::NetacqCountry, u64::from(rec.netacq_country));
            }
            if self.geo_mode == GeoMode::Full {
                if self.class_enabled(MetricClass::NetacqRegion) {
                    push_flat(out, MetricClass::NetacqRegion, u64::from(rec.netacq_region));
                }
                if self.class_enabled(MetricClass::NetacqPolygon) {
                    push_flat(out, MetricClass::NetacqPolygon, u64::from(rec.netacq_polygon));
                }
            }
        }

        if rec.providers & super::providers::PFX2AS != 0
            && self.class_enabled(MetricClass::PrefixAsn)
            && rec.prefix_asn != 0
        {
            push_flat(out, MetricClass::PrefixAsn, u64::from(rec.prefix_asn));
        }

        if rec.providers & super::providers::IPINFO != 0 {
            if self.class_enabled(MetricClass::IpinfoContinent) {
                push_flat(out, MetricClass::IpinfoContinent, u64::from(rec.ipinfo_continent));
            }
            if self.class_enabled(MetricClass::IpinfoCountry) {
                let mut tag = MetricTag::flat(MetricId::new(
                    MetricClass::IpinfoCountry,
                    u64::from(rec.ipinfo_country),
                ));
                self.associate_couplet(
                    &mut tag,
                    MetricClass::IpinfoCountryPrefixAsn,
                    u32::from(rec.ipinfo_country),
                    rec,
                );
                push_tag(out, tag);
            }
            if self.geo_mode == GeoMode::Full && self.class_enabled(MetricClass::IpinfoRegion) {
                let mut tag = MetricTag::flat(MetricId::new(
                    MetricClass::IpinfoRegion,
                    u64::from(rec.ipinfo_region),
                ));
                self.associate_couplet(
                    &mut tag,
                    MetricClass::IpinfoRegionPrefixAsn,
                    u32::from(rec.ipinfo_region),
                    rec,
                );
                push_tag(out, tag);
            }
        }

        if self.class_enabled(MetricClass::FilterCriteria) && rec.filter_bits != 0 {
            for bit in 0..64 {
                if rec.filter_bits & (1 << bit) != 0 {
                    push_flat(out, MetricClass::FilterCriteria, bit);
                }
            }
        }
    }

    fn associate_couplet(
        &self,
        tag: &mut MetricTag,
        class: MetricClass,
        geo_code: u32,
        rec: &TagRecord,
    ) {
        if !self.class_enabled(class)
            || rec.providers & super::providers::PFX2AS == 0
            || rec.prefix_asn == 0
            || tag.associated.len() >= MAX_ASSOCIATED_METRICS
            || !self.couplet_allowed(geo_code, rec.prefix_asn)
        {
            return;
        }
        tag.associated
            .push(MetricId::couplet(class, geo_code, rec.prefix_asn));
    }
}

fn ip_count_policy(method: IpCountMethod, subnetmask: u8, role: &str) -> IpCountPolicy {
    let prefix_bits = if subnetmask == 0 || subnetmask > 32 {
        warn!(role, subnetmask, "subnetmask out of range, using 32");
        32
    } else {
        subnetmask
    };
    IpCountPolicy {
        method,
        prefix_bits,
    }
}

fn build_port_bitmap(ranges: &[String]) -> PortBitmap {
    if ranges.is_empty() {
        return PortBitmap::all();
    }
    let mut bitmap = PortBitmap::none();
    let mut any = false;
    for range in ranges {
        match parse_port_range(range) {
            Some((first, last)) => {
                info!(first, last, "setting port range");
                bitmap.set_range(first, last);
                any = true;
            }
            None => warn!(range = %range, "invalid port range, ignoring"),
        }
    }
    // Every configured range was unusable; fall back to reporting all ports.
    if any {
        bitmap
    } else {
        PortBitmap::all()
    }
}

fn push_flat(out: &mut Vec<MetricTag>, class: MetricClass, value: u64) {
    push_tag(out, MetricTag::flat(MetricId::new(class, value)));
}

fn push_tag(out: &mut Vec<MetricTag>, tag: MetricTag) {
    if out.len() < MAX_TAGS_PER_PACKET {
        out.push(tag);
    }
}
