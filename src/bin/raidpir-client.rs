//! RAID-PIR client: reads a manifest, privately retrieves a set of files
//! from `k` mirrors, and writes them to the current directory.
//!
//! Argument parsing is out of scope for the library (spec.md §1, §6); this
//! binary implements just enough of it to drive `query`/`scheduler` end to
//! end. Flags follow the original implementation
//! (`original_source/raidpir_client.py`), supplemented in SPEC_FULL.md §10.4.

use anyhow::{bail, Context, Result};
use log::info;
use rand::rngs::StdRng;
use rand::SeedableRng;
use raid_pir::manifest::Manifest;
use raid_pir::query::{self, Mode};
use raid_pir::scheduler::{self, SchedulerConfig};
use raid_pir::vendor;
use std::net::ToSocketAddrs;
use std::path::PathBuf;

struct ClientConfig {
    manifest_path: PathBuf,
    retrieve_manifest_from: Option<(String, u16)>,
    vendor_override: Option<(String, u16)>,
    k: usize,
    r: Option<usize>,
    rng: bool,
    parallel: bool,
    batch: bool,
    timing: bool,
    print_files: bool,
    files: Vec<String>,
}

fn parse_host_port(s: &str) -> Result<(String, u16)> {
    let (host, port) = s
        .rsplit_once(':')
        .with_context(|| format!("expected host:port, got {:?}", s))?;
    Ok((
        host.to_string(),
        port.parse().with_context(|| format!("invalid port in {:?}", s))?,
    ))
}

fn parse_args() -> Result<ClientConfig> {
    let mut manifest_path = PathBuf::from("manifest.dat");
    let mut retrieve_manifest_from = None;
    let mut vendor_override = None;
    let mut k = 2usize;
    let mut r = None;
    let mut rng = false;
    let mut parallel = false;
    let mut batch = false;
    let mut timing = false;
    let mut print_files = false;
    let mut files = Vec::new();

    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "-m" | "--manifest" => {
                manifest_path = PathBuf::from(args.next().context("-m requires a value")?)
            }
            "--retrieve-manifest-from" => {
                let v = args.next().context("--retrieve-manifest-from requires host:port")?;
                retrieve_manifest_from = Some(parse_host_port(&v)?);
            }
            "--vendor" => {
                let v = args.next().context("--vendor requires host:port")?;
                vendor_override = Some(parse_host_port(&v)?);
            }
            "-k" | "--mirrors" => {
                k = args
                    .next()
                    .context("-k requires a value")?
                    .parse()
                    .context("-k must be an integer")?;
            }
            "-r" | "--redundancy" => {
                r = Some(
                    args.next()
                        .context("-r requires a value")?
                        .parse::<usize>()
                        .context("-r must be an integer")?,
                );
            }
            "-R" | "--rng" => rng = true,
            "-p" | "--parallel" => {
                parallel = true;
                rng = true; // -p implies -R, matching the original client
            }
            "-b" | "--batch" => batch = true,
            "-t" | "--timing" => timing = true,
            "--print-files" => print_files = true,
            other if other.starts_with('-') => bail!("unrecognized argument: {}", other),
            other => files.push(other.to_string()),
        }
    }

    if k < 2 {
        bail!("mirrors to contact must be > 1 (-k)");
    }
    if let Some(r) = r {
        if r < 2 {
            bail!("redundancy must be > 1 (-r)");
        }
        if r > k {
            bail!("redundancy must be <= number of mirrors (-k {})", k);
        }
    }
    if (rng || parallel) && r.is_none() {
        bail!("chunks must be enabled (-r <n>) to use -R or -p");
    }
    if files.is_empty() && !print_files {
        bail!("must specify at least one file to retrieve");
    }

    Ok(ClientConfig {
        manifest_path,
        retrieve_manifest_from,
        vendor_override,
        k,
        r,
        rng,
        parallel,
        batch,
        timing,
        print_files,
        files,
    })
}

fn mode_of(config: &ClientConfig) -> Mode {
    match (config.r, config.rng, config.parallel) {
        (None, _, _) => Mode::Plain,
        (Some(_), false, _) => Mode::Chunked,
        (Some(_), true, false) => Mode::Seeded,
        (Some(_), true, true) => Mode::SeededParallel,
    }
}

/// Concatenates a file's blocks (looked up from `blocks`) and slices out
/// exactly `fileinfo.length` bytes starting at `fileinfo.offset`'s
/// in-block remainder. File extraction from reconstructed blocks is out
/// of scope for the library (spec.md §1); this is the minimal glue a
/// caller needs to go from blocks back to bytes.
fn extract_file(
    manifest: &Manifest,
    name: &str,
    block_bytes: &std::collections::HashMap<u32, Vec<u8>>,
) -> Result<Vec<u8>> {
    let info = manifest.file_info(name)?;
    let blocksize = manifest.blocksize() as u64;
    let first_block = info.offset / blocksize;
    let within = (info.offset % blocksize) as usize;

    let mut buf = Vec::new();
    let mut block_idx = first_block as u32;
    while (buf.len() as u64) < within as u64 + info.length {
        let block = block_bytes
            .get(&block_idx)
            .with_context(|| format!("missing reconstructed block {} for {}", block_idx, name))?;
        buf.extend_from_slice(block);
        block_idx += 1;
    }
    buf.truncate(within + info.length as usize);
    Ok(buf.split_off(within))
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();
    let config = parse_args()?;

    let manifest = if let Some((host, port)) = &config.retrieve_manifest_from {
        let manifest = vendor::fetch_manifest(host, *port).await?;
        std::fs::write(&config.manifest_path, manifest.to_bytes()?)
            .context("writing retrieved manifest to disk")?;
        manifest
    } else {
        let bytes = std::fs::read(&config.manifest_path)
            .with_context(|| format!("reading manifest {:?}", config.manifest_path))?;
        Manifest::parse(&bytes)?
    };

    if config.print_files {
        for (name, _, blocks) in manifest.files() {
            println!("{} ({} blocks)", name, blocks.len());
        }
        return Ok(());
    }

    if config.r.is_some() && manifest.blockcount() < config.k * 8 {
        bail!("block count too low to use chunks with {} mirrors", config.k);
    }

    for name in &config.files {
        manifest.blocks_for_file(name)?;
    }

    let (vendor_host, vendor_port) = config
        .vendor_override
        .clone()
        .unwrap_or_else(|| manifest.vendor_address());
    let mirror_records = vendor::fetch_mirror_list(&vendor_host, vendor_port).await?;
    if mirror_records.len() < config.k {
        bail!(
            "vendor advertised only {} mirrors, need {}",
            mirror_records.len(),
            config.k
        );
    }
    let mut addrs = Vec::with_capacity(config.k);
    for record in mirror_records.into_iter().take(config.k) {
        let resolved = (record.ip.as_str(), record.port)
            .to_socket_addrs()
            .with_context(|| format!("resolving mirror {}:{}", record.ip, record.port))?
            .next()
            .with_context(|| format!("no address for mirror {}:{}", record.ip, record.port))?;
        addrs.push(resolved);
    }

    let blocks = manifest.blocks_for_files(&config.files)?;
    info!("requesting {} blocks across {} mirrors", blocks.len(), config.k);

    let mut rng_source = StdRng::from_entropy();
    let built = query::build_queries(
        &blocks,
        manifest.blockcount(),
        config.k,
        config.r.unwrap_or(0),
        mode_of(&config),
        &mut rng_source,
    )?;

    let verify_block = |index: u32, bytes: &[u8]| manifest.verify_block_hash(index, bytes);
    let (results, timings) = scheduler::run(
        addrs,
        built,
        manifest.blocksize(),
        SchedulerConfig {
            batch: config.batch,
            ..SchedulerConfig::default()
        },
        Some(&verify_block),
    )
    .await?;

    if config.timing {
        for (mirror, elapsed) in timings.per_mirror.iter().enumerate() {
            eprintln!("mirror {}: {:?} spent in round-trips", mirror, elapsed);
        }
    }

    let block_bytes: std::collections::HashMap<u32, Vec<u8>> = results.into_iter().collect();

    for name in &config.files {
        let data = extract_file(&manifest, name, &block_bytes)?;
        manifest.verify_file_hash(name, &data)?;
        let out_name = PathBuf::from(name)
            .file_name()
            .with_context(|| format!("invalid filename {:?}", name))?
            .to_owned();
        std::fs::write(&out_name, &data)
            .with_context(|| format!("writing {:?}", out_name))?;
        println!("wrote {:?}", out_name);
    }

    Ok(())
}
