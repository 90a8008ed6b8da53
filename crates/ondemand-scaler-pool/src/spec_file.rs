//! Loading pool definitions from YAML.
//!
//! The file is an ordered list of flat attribute maps:
//!
//! ```yaml
//! - cpu: 4000
//!   mem: 8GiB
//!   disk: 50GB
//!   datacenter: dc1
//!   drivers: [docker]
//!   devices:
//!     - {name: T4, type: gpu, vendor: nvidia}
//!   provider:
//!     name: anynode
//! ```
//!
//! Size fields accept human-readable strings and are normalized to MB before
//! the spec is fingerprinted, so `mem: 8GiB` and `mem: 8192` are the same pool.

use std::collections::{BTreeMap, HashSet};
use std::path::Path;

use ondemand_scaler_core::Variant;

use crate::error::{PoolError, Result};
use crate::spec::PoolNodeSpec;

/// Read and parse the pool definition file at `path`.
///
/// # Errors
///
/// Returns an error if the file cannot be read or any definition is invalid.
pub fn load_pool_specs(path: impl AsRef<Path>) -> Result<Vec<PoolNodeSpec>> {
    let path = path.as_ref();
    let text = std::fs::read_to_string(path).map_err(|source| PoolError::Io {
        path: path.display().to_string(),
        source,
    })?;
    parse_pool_specs(&text)
}

/// Parse pool definitions from YAML text, preserving file order.
///
/// # Errors
///
/// Returns an error on malformed YAML, unparseable sizes, a missing provider
/// descriptor or two definitions that resolve to the same pool.
pub fn parse_pool_specs(text: &str) -> Result<Vec<PoolNodeSpec>> {
    let raw: Vec<BTreeMap<String, Variant>> = serde_yaml::from_str(text)?;
    let mut seen = HashSet::new();
    let mut specs = Vec::with_capacity(raw.len());

    for (index, mut attributes) in raw.into_iter().enumerate() {
        normalize(&mut attributes).map_err(|e| PoolError::Spec(format!("pool #{index}: {e}")))?;
        validate_provider(&attributes)
            .map_err(|e| PoolError::Spec(format!("pool #{index}: {e}")))?;

        let spec = PoolNodeSpec::new(attributes);
        if !seen.insert(spec.full_name().to_string()) {
            return Err(PoolError::Spec(format!(
                "pool #{index} duplicates pool {}",
                spec.full_name()
            )));
        }
        specs.push(spec);
    }

    Ok(specs)
}

fn normalize(attributes: &mut BTreeMap<String, Variant>) -> std::result::Result<(), String> {
    for key in ["mem", "disk"] {
        normalize_size(attributes, key, key)?;
    }

    if let Some(reserved) = attributes.get_mut("reserved").and_then(Variant::as_map_mut) {
        for key in ["mem", "disk"] {
            normalize_size(reserved, key, &format!("reserved.{key}"))?;
        }
    }

    if let Some(devices) = attributes.get_mut("devices").and_then(Variant::as_list_mut) {
        for device in devices.iter_mut().filter_map(Variant::as_map_mut) {
            device
                .entry("count".to_string())
                .or_insert(Variant::Int(1));
        }
    }

    Ok(())
}

fn normalize_size(
    map: &mut BTreeMap<String, Variant>,
    key: &str,
    label: &str,
) -> std::result::Result<(), String> {
    if let Some(Variant::Str(text)) = map.get(key) {
        let bytes = parse_bytes(text).map_err(|e| format!("can't parse {label}: {e}"))?;
        let mb = i64::try_from(bytes / 1024 / 1024).map_err(|_| format!("{label} is too large"))?;
        map.insert(key.to_string(), Variant::Int(mb));
    }
    Ok(())
}

fn validate_provider(attributes: &BTreeMap<String, Variant>) -> std::result::Result<(), String> {
    let provider = attributes
        .get("provider")
        .ok_or_else(|| "missing provider".to_string())?;
    let provider = provider
        .as_map()
        .ok_or_else(|| format!("provider must be a map, found {}", provider.kind()))?;
    match provider.get("name") {
        Some(Variant::Str(_)) => Ok(()),
        Some(other) => Err(format!("provider name must be a string, found {}", other.kind())),
        None => Err("provider has no name".to_string()),
    }
}

/// Parse a human-readable byte size (`512`, `1.5 GB`, `8GiB`, `100M`).
///
/// Decimal units (`k`, `kb`, `m`, `mb`, ...) are powers of 1000, binary units
/// (`ki`, `kib`, `mi`, `mib`, ...) powers of 1024; a bare number is bytes.
///
/// # Errors
///
/// Returns a message if the number or unit is not recognized.
pub fn parse_bytes(text: &str) -> std::result::Result<u64, String> {
    let trimmed = text.trim();
    let split = trimmed
        .find(|c: char| !(c.is_ascii_digit() || c == '.' || c == ','))
        .unwrap_or(trimmed.len());
    let (number, unit) = trimmed.split_at(split);
    let number: f64 = number
        .replace(',', "")
        .parse()
        .map_err(|_| format!("invalid size {text:?}"))?;

    let multiplier: u64 = match unit.trim().to_ascii_lowercase().as_str() {
        "" | "b" | "byte" | "bytes" => 1,
        "k" | "kb" => 1_000,
        "ki" | "kib" => 1 << 10,
        "m" | "mb" => 1_000_000,
        "mi" | "mib" => 1 << 20,
        "g" | "gb" => 1_000_000_000,
        "gi" | "gib" => 1 << 30,
        "t" | "tb" => 1_000_000_000_000,
        "ti" | "tib" => 1 << 40,
        "p" | "pb" => 1_000_000_000_000_000,
        "pi" | "pib" => 1 << 50,
        other => return Err(format!("unknown size unit {other:?}")),
    };

    #[allow(
        clippy::cast_precision_loss,
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss
    )]
    let bytes = (number * multiplier as f64) as u64;
    Ok(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn parse_bytes_units() {
        assert_eq!(parse_bytes("512").unwrap(), 512);
        assert_eq!(parse_bytes("1KB").unwrap(), 1000);
        assert_eq!(parse_bytes("1KiB").unwrap(), 1024);
        assert_eq!(parse_bytes("8GiB").unwrap(), 8 << 30);
        assert_eq!(parse_bytes("1.5 GB").unwrap(), 1_500_000_000);
        assert_eq!(parse_bytes("1,000 mb").unwrap(), 1_000_000_000);
        assert!(parse_bytes("lots").is_err());
        assert!(parse_bytes("5 parsecs").is_err());
    }

    #[test]
    fn sizes_normalize_to_mb() {
        let specs = parse_pool_specs(
            "
- cpu: 1000
  mem: 8GiB
  disk: 1GB
  reserved:
    mem: 512MiB
  provider: {name: anynode}
",
        )
        .unwrap();
        let attrs = specs[0].attributes();
        assert_eq!(attrs["mem"], Variant::Int(8192));
        assert_eq!(attrs["disk"], Variant::Int(953));
        assert_eq!(attrs["reserved"].as_map().unwrap()["mem"], Variant::Int(512));
    }

    #[test]
    fn human_and_numeric_sizes_are_the_same_pool() {
        let specs = parse_pool_specs(
            "
- {cpu: 1000, mem: 2GiB, provider: {name: anynode}}
- {cpu: 1000, mem: 2048, provider: {name: anynode}}
",
        );
        assert!(matches!(specs, Err(PoolError::Spec(msg)) if msg.contains("duplicates")));
    }

    #[test]
    fn devices_default_count() {
        let specs = parse_pool_specs(
            "
- cpu: 1000
  devices:
    - {name: T4, type: gpu, vendor: nvidia}
    - {name: A10, type: gpu, vendor: nvidia, count: 4}
  provider: {name: anynode}
",
        )
        .unwrap();
        let devices = specs[0].attributes()["devices"].as_list().unwrap();
        assert_eq!(devices[0].as_map().unwrap()["count"], Variant::Int(1));
        assert_eq!(devices[1].as_map().unwrap()["count"], Variant::Int(4));
    }

    #[test]
    fn order_is_preserved() {
        let specs = parse_pool_specs(
            "
- {cpu: 3000, provider: {name: anynode}}
- {cpu: 1000, provider: {name: anynode}}
- {cpu: 2000, provider: {name: anynode}}
",
        )
        .unwrap();
        let names: Vec<_> = specs.iter().map(PoolNodeSpec::name).collect();
        assert_eq!(names, ["cpu:3000", "cpu:1000", "cpu:2000"]);
    }

    #[test]
    fn provider_is_required() {
        let err = parse_pool_specs("- {cpu: 1000}").unwrap_err();
        assert!(err.to_string().contains("missing provider"));

        let err = parse_pool_specs("- {cpu: 1000, provider: anynode}").unwrap_err();
        assert!(err.to_string().contains("provider must be a map"));

        let err = parse_pool_specs("- {cpu: 1000, provider: {params: {}}}").unwrap_err();
        assert!(err.to_string().contains("no name"));
    }

    #[test]
    fn bad_size_is_reported() {
        let err = parse_pool_specs("- {mem: huge, provider: {name: anynode}}").unwrap_err();
        assert!(err.to_string().contains("can't parse mem"));
    }

    #[test]
    fn load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "- {{cpu: 1000, provider: {{name: anynode}}}}").unwrap();
        let specs = load_pool_specs(file.path()).unwrap();
        assert_eq!(specs.len(), 1);

        assert!(matches!(
            load_pool_specs("/nonexistent/pools.yml"),
            Err(PoolError::Io { .. })
        ));
    }
}
