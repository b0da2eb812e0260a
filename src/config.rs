use crate::handle_table::{EnumerateOptions, TableFormat};
use crate::kernel::{GrowLimits, DEFAULT_INITIAL_BUFFER, DEFAULT_MAX_ATTEMPTS, DEFAULT_MAX_BUFFER};
use crate::object_name::AccessMaskDenylist;

pub const ENV_MAX_ATTEMPTS: &str = "HANDLE_PROBE_MAX_ATTEMPTS";
pub const ENV_INITIAL_BUFFER: &str = "HANDLE_PROBE_INITIAL_BUFFER";
pub const ENV_MAX_BUFFER: &str = "HANDLE_PROBE_MAX_BUFFER";
pub const ENV_DENYLIST: &str = "HANDLE_PROBE_DENYLIST";
pub const ENV_LEGACY_TABLE: &str = "HANDLE_PROBE_LEGACY_TABLE";
pub const ENV_SKIP_DENYLISTED: &str = "HANDLE_PROBE_SKIP_DENYLISTED";

/// Settings for a handle enumeration run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeConfig {
    pub limits: GrowLimits,
    pub format: TableFormat,
    pub denylist: AccessMaskDenylist,
    pub report_denylisted: bool,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            limits: GrowLimits::default(),
            format: TableFormat::default(),
            denylist: AccessMaskDenylist::default(),
            report_denylisted: true,
        }
    }
}

impl ProbeConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(get_env_var)
    }

    /// Builds the config from an arbitrary key lookup. Unset or unparsable
    /// keys keep their defaults.
    pub fn from_lookup<F: Fn(&str) -> Option<String>>(lookup: F) -> Self {
        let mut config = Self::default();

        if let Some(attempts) = lookup(ENV_MAX_ATTEMPTS).and_then(|v| parse_number(&v)) {
            config.limits.max_attempts = u32::try_from(attempts).unwrap_or(DEFAULT_MAX_ATTEMPTS).max(1);
        }
        if let Some(len) = lookup(ENV_INITIAL_BUFFER).and_then(|v| parse_number(&v)) {
            config.limits.initial_len = usize::try_from(len).unwrap_or(DEFAULT_INITIAL_BUFFER);
        }
        if let Some(len) = lookup(ENV_MAX_BUFFER).and_then(|v| parse_number(&v)) {
            config.limits.max_len = usize::try_from(len).unwrap_or(DEFAULT_MAX_BUFFER);
        }
        if let Some(list) = lookup(ENV_DENYLIST) {
            config.denylist = config.denylist.extended(parse_mask_list(&list));
        }
        if check_flag(&lookup, ENV_LEGACY_TABLE) {
            config.format = TableFormat::Legacy;
        }
        if check_flag(&lookup, ENV_SKIP_DENYLISTED) {
            config.report_denylisted = false;
        }
        config
    }

    pub fn enumerate_options(&self) -> EnumerateOptions {
        EnumerateOptions {
            format: self.format,
            limits: self.limits,
            report_denylisted: self.report_denylisted,
        }
    }
}

fn get_env_var(key: &str) -> Option<String> {
    std::env::var(key).ok()
}

fn check_flag<F: Fn(&str) -> Option<String>>(lookup: &F, key: &str) -> bool {
    match lookup(key) {
        Some(val) => {
            let v = val.trim().to_ascii_lowercase();
            v == "1" || v == "true" || v == "yes"
        }
        None => false,
    }
}

/// Accepts `0x`-prefixed hex or plain decimal.
pub fn parse_number(s: &str) -> Option<u64> {
    let s = s.trim();
    match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(&hex.replace('_', ""), 16).ok(),
        None => s.replace('_', "").parse::<u64>().ok(),
    }
}

pub fn parse_mask(s: &str) -> Option<u32> {
    parse_number(s).and_then(|v| u32::try_from(v).ok())
}

/// Comma separated masks; malformed items are dropped.
pub fn parse_mask_list(s: &str) -> Vec<u32> {
    s.split(',')
        .filter(|item| !item.trim().is_empty())
        .filter_map(|item| {
            let mask = parse_mask(item);
            if mask.is_none() {
                log::warn!("ignoring malformed access mask `{}`", item.trim());
            }
            mask
        })
        .collect()
}
