//! Configuration options consumed by the router core.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fs;
use std::net::IpAddr;
use std::path::{Path, PathBuf};

use crate::error::Error;

/// Ports picked for new routers fall in this range.
pub const PORT_RANGE: std::ops::Range<u16> = 9111..30777;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Config {
	pub datadir: PathBuf,
	pub kovriconf: Option<PathBuf>,
	pub tunnelsconf: Option<PathBuf>,
	pub host: Option<IpAddr>,
	pub port: Option<u16>,
	pub floodfill: bool,
	/// one of L, M, N, O, P, X
	pub bandwidth: char,
	pub enable_ssu: bool,
	pub enable_ntcp: bool,
	pub ssu_introducer: bool,
	pub ssu_testing: bool,
	pub reseed_urls: Vec<String>,
}

impl Default for Config {
	fn default() -> Self {
		Config {
			datadir: PathBuf::from("."),
			kovriconf: None,
			tunnelsconf: None,
			host: None,
			port: None,
			floodfill: false,
			bandwidth: 'L',
			enable_ssu: true,
			enable_ntcp: true,
			ssu_introducer: false,
			ssu_testing: false,
			reseed_urls: Vec::new(),
		}
	}
}

fn parse_bool(value: &str) -> bool {
	matches!(value.trim(), "1" | "true" | "yes" | "on")
}

impl Config {
	/// Reads `key = value` lines; `#` starts a comment. Unknown keys are
	/// ignored so configs can be shared with the outer services.
	pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, Error> {
		let content = fs::read_to_string(path)?;
		let mut config = Config::default();
		for line in content.lines() {
			let line = line.split('#').next().unwrap_or("").trim();
			if line.is_empty() {
				continue;
			}
			let Some((key, value)) = line.split_once('=') else {
				return Err(Error::Config(format!("malformed line '{}'", line)));
			};
			let (key, value) = (key.trim(), value.trim());
			match key {
				"datadir" => config.datadir = PathBuf::from(value),
				"kovriconf" => config.kovriconf = Some(PathBuf::from(value)),
				"tunnelsconf" => config.tunnelsconf = Some(PathBuf::from(value)),
				"host" => {
					config.host = Some(
						value
							.parse()
							.map_err(|_| Error::Config(format!("bad host '{}'", value)))?,
					)
				}
				"port" => {
					config.port = Some(
						value
							.parse()
							.map_err(|_| Error::Config(format!("bad port '{}'", value)))?,
					)
				}
				"floodfill" => config.floodfill = parse_bool(value),
				"bandwidth" => {
					let c = value.chars().next().unwrap_or('L');
					if !"LMNOPX".contains(c) {
						return Err(Error::Config(format!("bad bandwidth '{}'", value)));
					}
					config.bandwidth = c;
				}
				"enable-ssu" => config.enable_ssu = parse_bool(value),
				"enable-ntcp" => config.enable_ntcp = parse_bool(value),
				"ssu-introducer" => config.ssu_introducer = parse_bool(value),
				"ssu-testing" => config.ssu_testing = parse_bool(value),
				"reseed-urls" => {
					config.reseed_urls =
						value.split(',').map(|s| s.trim().to_string()).collect()
				}
				_ => {}
			}
		}
		Ok(config)
	}

	pub fn validate(&self) -> Result<(), Error> {
		if !self.enable_ntcp && !self.enable_ssu {
			return Err(Error::Config("at least one transport must be enabled".into()));
		}
		Ok(())
	}

	/// The configured port, or a random one from the router range.
	pub fn port_or_random(&self) -> u16 {
		self.port
			.unwrap_or_else(|| rand::thread_rng().gen_range(PORT_RANGE))
	}

	/// The capability string published in our router info.
	pub fn caps_string(&self) -> String {
		let mut caps = String::new();
		if self.floodfill {
			caps.push('f');
		}
		caps.push(self.bandwidth);
		caps.push('R');
		if self.ssu_testing {
			caps.push('B');
		}
		if self.ssu_introducer {
			caps.push('C');
		}
		caps
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::io::Write;

	#[test]
	fn defaults_enable_both_transports() {
		let config = Config::default();
		assert!(config.validate().is_ok());
		assert!(config.enable_ntcp && config.enable_ssu);
		assert_eq!(config.caps_string(), "LR");
	}

	#[test]
	fn parse_file() {
		let mut file = tempfile::NamedTempFile::new().unwrap();
		writeln!(file, "# router config").unwrap();
		writeln!(file, "host = 10.11.12.13").unwrap();
		writeln!(file, "port = 12001").unwrap();
		writeln!(file, "floodfill = 1").unwrap();
		writeln!(file, "bandwidth = P").unwrap();
		writeln!(file, "enable-ssu = 0").unwrap();
		writeln!(file, "ssu-testing = 1").unwrap();
		writeln!(file, "reseed-urls = https://a.example/,https://b.example/").unwrap();
		let config = Config::from_file(file.path()).unwrap();
		assert_eq!(config.host, Some("10.11.12.13".parse().unwrap()));
		assert_eq!(config.port, Some(12001));
		assert!(config.floodfill);
		assert_eq!(config.bandwidth, 'P');
		assert!(!config.enable_ssu);
		assert_eq!(config.reseed_urls.len(), 2);
		assert_eq!(config.caps_string(), "fPRB");
	}

	#[test]
	fn bad_values_are_config_errors() {
		let mut file = tempfile::NamedTempFile::new().unwrap();
		writeln!(file, "bandwidth = Q").unwrap();
		assert!(matches!(
			Config::from_file(file.path()),
			Err(Error::Config(_))
		));
	}

	#[test]
	fn no_transports_is_invalid() {
		let config = Config {
			enable_ntcp: false,
			enable_ssu: false,
			..Default::default()
		};
		assert!(config.validate().is_err());
	}

	#[test]
	fn random_port_in_range() {
		let config = Config::default();
		for _ in 0..50 {
			let port = config.port_or_random();
			assert!(PORT_RANGE.contains(&port));
		}
	}
}
