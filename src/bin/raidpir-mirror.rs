//! RAID-PIR mirror daemon: serves XOR responses from a flat block store.
//!
//! Argument parsing and daemonization are out of scope for the library
//! (spec.md §1); this binary does only enough of both to exercise
//! `store`/`responder`/`protocol` end to end.

use anyhow::{bail, Context, Result};
use log::{debug, info, warn};
use raid_pir::protocol::{read_frame, write_frame};
use raid_pir::responder;
use raid_pir::store::BlockStore;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};

struct MirrorConfig {
    listen: SocketAddr,
    db_path: String,
    blocksize: usize,
    blockcount: usize,
}

fn parse_args() -> Result<MirrorConfig> {
    let mut listen = None;
    let mut db_path = None;
    let mut blocksize = None;
    let mut blockcount = None;

    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--listen" => {
                let v = args.next().context("--listen requires a value")?;
                listen = Some(
                    v.parse::<SocketAddr>()
                        .with_context(|| format!("invalid --listen address {:?}", v))?,
                );
            }
            "--db" => db_path = Some(args.next().context("--db requires a value")?),
            "--blocksize" => {
                let v = args.next().context("--blocksize requires a value")?;
                blocksize = Some(v.parse::<usize>().context("--blocksize must be an integer")?);
            }
            "--blockcount" => {
                let v = args.next().context("--blockcount requires a value")?;
                blockcount = Some(
                    v.parse::<usize>()
                        .context("--blockcount must be an integer")?,
                );
            }
            other => bail!("unrecognized argument: {}", other),
        }
    }

    Ok(MirrorConfig {
        listen: listen.context("--listen <ip:port> is required")?,
        db_path: db_path.context("--db <path> is required")?,
        blocksize: blocksize.context("--blocksize <bytes> is required")?,
        blockcount: blockcount.context("--blockcount <n> is required")?,
    })
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();
    let config = parse_args()?;

    let store = Arc::new(
        BlockStore::open(&config.db_path, config.blocksize, config.blockcount)
            .with_context(|| format!("opening block store {:?}", config.db_path))?,
    );

    let listener = TcpListener::bind(config.listen)
        .await
        .with_context(|| format!("binding {}", config.listen))?;
    info!(
        "raidpir-mirror listening on {} ({} blocks x {} bytes)",
        config.listen, config.blockcount, config.blocksize
    );

    loop {
        let (socket, peer) = listener.accept().await?;
        let store = Arc::clone(&store);
        tokio::spawn(async move {
            info!("connection from {}", peer);
            if let Err(e) = serve_connection(socket, store).await {
                warn!("connection from {} ended: {}", peer, e);
            }
        });
    }
}

async fn serve_connection(mut socket: TcpStream, store: Arc<BlockStore>) -> Result<()> {
    loop {
        let frame = match read_frame(&mut socket).await {
            Ok(f) => f,
            Err(_) => return Ok(()), // peer closed the connection
        };
        let query = raid_pir::protocol::MirrorQuery::decode(&frame)?;
        debug!("decoded query, computing reply");
        let replies = responder::answer(&store, &query)?;
        let mut out = Vec::with_capacity(replies.iter().map(Vec::len).sum());
        for block in replies {
            out.extend_from_slice(&block);
        }
        write_frame(&mut socket, &out).await?;
    }
}
