//! Administrative utility: base64/base32 codecs and router-info tooling.
//!
//! ```text
//! i2p-util base64 encode <infile> <outfile>
//! i2p-util base32 decode <infile> <outfile>
//! i2p-util routerinfo <file>...
//! i2p-util routerinfo --create [options] [filename]
//! ```

use anyhow::{anyhow, bail, Context, Result};
use std::fs::File;
use std::io::{Read, Write};
use std::net::{IpAddr, SocketAddr};

use i2p_router::config::PORT_RANGE;
use i2p_router::data::router_info::TransportStyle;
use i2p_router::data::{PrivateKeys, RouterInfo, BASE32_I2P, BASE64_I2P};

// stream chunk sizes: 12 input bytes encode to 16 base64 chars, 40 to 64
// base32 chars, so chunk boundaries stay alignment-safe
const BASE64_CHUNK: usize = 12;
const BASE32_CHUNK: usize = 40;

fn main() {
	env_logger::init();
	let args: Vec<String> = std::env::args().skip(1).collect();
	if let Err(e) = run(&args) {
		eprintln!("i2p-util: {:#}", e);
		std::process::exit(1);
	}
}

fn run(args: &[String]) -> Result<()> {
	match args.first().map(String::as_str) {
		Some("base64") => codec_command(&args[1..], true),
		Some("base32") => codec_command(&args[1..], false),
		Some("routerinfo") => routerinfo_command(&args[1..]),
		_ => {
			eprintln!("usage: i2p-util <base64|base32|routerinfo> ...");
			bail!("unknown subcommand");
		}
	}
}

//
// base64 / base32
//

fn codec_command(args: &[String], base64: bool) -> Result<()> {
	let (direction, input, output) = match args {
		[direction, input, output] => (direction.as_str(), input, output),
		_ => bail!("usage: <encode|decode> <infile> <outfile>"),
	};
	let mut reader = File::open(input).with_context(|| format!("opening {}", input))?;
	let mut writer = File::create(output).with_context(|| format!("creating {}", output))?;
	match direction {
		"encode" => encode_stream(&mut reader, &mut writer, base64),
		"decode" => decode_stream(&mut reader, &mut writer, base64),
		other => bail!("unknown direction '{}'", other),
	}
}

fn encode_stream(reader: &mut impl Read, writer: &mut impl Write, base64: bool) -> Result<()> {
	let chunk_size = if base64 { BASE64_CHUNK } else { BASE32_CHUNK };
	let mut chunk = vec![0u8; chunk_size];
	loop {
		let n = read_up_to(reader, &mut chunk)?;
		if n == 0 {
			break;
		}
		let encoded = if base64 {
			BASE64_I2P.encode(&chunk[..n])
		} else {
			BASE32_I2P.encode(&chunk[..n])
		};
		writer.write_all(encoded.as_bytes())?;
	}
	Ok(())
}

fn decode_stream(reader: &mut impl Read, writer: &mut impl Write, base64: bool) -> Result<()> {
	// encoded chunk sizes matching the encoder's output blocks
	let chunk_size = if base64 { 16 } else { 64 };
	let mut chunk = vec![0u8; chunk_size];
	loop {
		let n = read_up_to(reader, &mut chunk)?;
		if n == 0 {
			break;
		}
		let text = std::str::from_utf8(&chunk[..n]).map_err(|_| anyhow!("malformed input"))?;
		let text = text.trim_end_matches(['\r', '\n']);
		if text.is_empty() {
			continue;
		}
		let decoded = if base64 {
			BASE64_I2P.decode(text.as_bytes())
		} else {
			BASE32_I2P.decode(text.as_bytes())
		}
		.map_err(|e| anyhow!("malformed input: {}", e))?;
		writer.write_all(&decoded)?;
	}
	Ok(())
}

fn read_up_to(reader: &mut impl Read, buf: &mut [u8]) -> Result<usize> {
	let mut filled = 0;
	while filled < buf.len() {
		match reader.read(&mut buf[filled..])? {
			0 => break,
			n => filled += n,
		}
	}
	Ok(filled)
}

//
// routerinfo
//

#[derive(Default)]
struct CreateOptions {
	host: Option<IpAddr>,
	port: Option<u16>,
	floodfill: bool,
	bandwidth: char,
	enable_ssu: bool,
	enable_ntcp: bool,
	ssu_introducer: bool,
	ssu_testing: bool,
	filename: Option<String>,
}

fn routerinfo_command(args: &[String]) -> Result<()> {
	if args.first().map(String::as_str) == Some("--create") {
		return create_router_info(&args[1..]);
	}
	if args.is_empty() {
		bail!("usage: routerinfo <file>... | routerinfo --create [options] [filename]");
	}
	for path in args {
		let info = RouterInfo::from_file(path)
			.map_err(|e| anyhow!("{}: {}", path, e))?;
		describe(path, &info);
	}
	Ok(())
}

fn describe(path: &str, info: &RouterInfo) {
	println!("{}:", path);
	println!("\tident: {}", info.hash());
	println!("\tb32: {}", info.hash().to_b32_address());
	println!("\tsignature type: {}", info.identity.sig_type().name());
	println!("\tpublished: {} ms", info.published().0);
	println!("\tcaps: {}", info.caps_string());
	println!(
		"\tsignature: {}",
		if info.verify().is_ok() { "valid" } else { "INVALID" }
	);
	for address in info.addresses() {
		let host = address.host_string().unwrap_or("?");
		let port = address.port().unwrap_or(0);
		print!("\taddress: {} {}:{}", address.style.as_str(), host, port);
		if let Some(mtu) = address.mtu() {
			print!(" mtu={}", mtu);
		}
		let introducers = address.introducers();
		if !introducers.is_empty() {
			print!(" introducers={}", introducers.len());
		}
		println!();
	}
}

fn create_router_info(args: &[String]) -> Result<()> {
	let mut options = CreateOptions {
		bandwidth: 'L',
		enable_ssu: true,
		enable_ntcp: true,
		..Default::default()
	};
	let mut iter = args.iter();
	while let Some(arg) = iter.next() {
		let mut value = |name: &str| {
			iter.next()
				.ok_or_else(|| anyhow!("{} requires a value", name))
		};
		match arg.as_str() {
			"--host" => options.host = Some(value("--host")?.parse()?),
			"--port" => options.port = Some(value("--port")?.parse()?),
			"--floodfill" => options.floodfill = value("--floodfill")? == "1",
			"--bandwidth" => {
				let v = value("--bandwidth")?;
				let c = v.chars().next().unwrap_or('L');
				if !"LMNOPX".contains(c) {
					bail!("bandwidth must be one of L M N O P X");
				}
				options.bandwidth = c;
			}
			"--enable-ssu" => options.enable_ssu = value("--enable-ssu")? != "0",
			"--enable-ntcp" => options.enable_ntcp = value("--enable-ntcp")? != "0",
			"--ssuintroducer" => options.ssu_introducer = value("--ssuintroducer")? == "1",
			"--ssutesting" => options.ssu_testing = value("--ssutesting")? == "1",
			other if !other.starts_with("--") && options.filename.is_none() => {
				options.filename = Some(other.to_string())
			}
			other => bail!("unknown option '{}'", other),
		}
	}
	if !options.enable_ntcp && !options.enable_ssu {
		bail!("at least one transport must be enabled");
	}

	let host = options
		.host
		.unwrap_or_else(|| "127.0.0.1".parse().unwrap());
	let port = options
		.port
		.unwrap_or_else(|| rand::random::<u16>() % (PORT_RANGE.end - PORT_RANGE.start) + PORT_RANGE.start);
	let mut endpoints: Vec<(TransportStyle, SocketAddr)> = Vec::new();
	if options.enable_ntcp {
		endpoints.push((TransportStyle::Ntcp, SocketAddr::new(host, port)));
	}
	if options.enable_ssu {
		endpoints.push((TransportStyle::Ssu, SocketAddr::new(host, port)));
	}
	let mut caps = String::new();
	if options.floodfill {
		caps.push('f');
	}
	caps.push(options.bandwidth);
	caps.push('R');
	if options.ssu_testing {
		caps.push('B');
	}
	if options.ssu_introducer {
		caps.push('C');
	}

	let keys = PrivateKeys::random_default().map_err(|e| anyhow!("key generation: {}", e))?;
	let info = RouterInfo::create(&keys, &endpoints, &caps)
		.map_err(|e| anyhow!("creating router info: {}", e))?;

	let filename = options.filename.unwrap_or_else(|| "routerInfo.dat".to_string());
	info.to_file(&filename)
		.map_err(|e| anyhow!("writing {}: {}", filename, e))?;
	keys.to_file(format!("{}.key", filename))
		.map_err(|e| anyhow!("writing {}.key: {}", filename, e))?;
	println!("created router {}", info.hash());
	describe(&filename, &info);
	Ok(())
}
