//! Request scheduler (§4.C): one worker task per mirror, each owning a
//! persistent connection, fed from a shared per-mirror job queue. The
//! coordinator (this module's [`run`]) builds the queues from a
//! [`BuiltQueries`], joins the workers, and reconstructs finished blocks
//! as replies arrive.
//!
//! **Reassignment.** Mirrors hold identical database copies (§3), so a
//! failed mirror's outstanding query can simply be resent verbatim to any
//! other live mirror - the reconstructor credits the reply to the
//! *logical* contributor role the query was built for
//! ([`MirrorJob::origin`]), not to whichever physical connection actually
//! executed it. Recovery is therefore possible exactly as long as at
//! least one mirror stays live; once the live set is empty, the retrieval
//! fails with [`RaidPirError::MirrorUnavailable`].

use crate::error::RaidPirError;
use crate::protocol::{self, MirrorQuery};
use crate::query::BuiltQueries;
use crate::reconstruct::Reconstructor;
use log::{debug, info, warn};
use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::timeout as tokio_timeout;

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub request_timeout: Duration,
    pub batch: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        SchedulerConfig {
            request_timeout: Duration::from_secs(30),
            batch: false,
        }
    }
}

#[derive(Debug, Default)]
pub struct Timings {
    /// Cumulative request/response round-trip time spent on each mirror's
    /// connection, indexed by mirror (not by logical contributor role -
    /// a reassigned request's time is billed to whichever mirror actually
    /// ran it).
    pub per_mirror: Vec<Duration>,
}

/// One outstanding request, tagged with the logical contributor role
/// (`origin`) it was built for, so the reconstructor can credit its reply
/// correctly no matter which physical mirror ends up executing it.
struct MirrorJob {
    origin: usize,
    query: MirrorQuery,
    labels: Vec<u32>,
}

enum WorkerEvent {
    Replies {
        origin: usize,
        labels: Vec<u32>,
        blocks: Vec<Vec<u8>>,
    },
    Failed {
        dead_mirror: usize,
        remaining: Vec<MirrorJob>,
    },
    Protocol {
        mirror: usize,
        message: String,
    },
}

pub async fn run(
    addrs: Vec<SocketAddr>,
    built: BuiltQueries,
    blocksize: usize,
    config: SchedulerConfig,
    verify_block: Option<&dyn Fn(u32, &[u8]) -> bool>,
) -> Result<(Vec<(u32, Vec<u8>)>, Timings), RaidPirError> {
    let k = addrs.len();
    if built.queries.len() != k || built.reply_labels.len() != k {
        return Err(RaidPirError::ParameterError(
            "query count does not match mirror address count".into(),
        ));
    }

    let total_blocks = built.plan.entries.len();
    let mut reconstructor = Reconstructor::new(&built.plan, blocksize);

    if total_blocks == 0 {
        return Ok((Vec::new(), Timings::default()));
    }

    let (event_tx, mut event_rx) = mpsc::unbounded_channel::<WorkerEvent>();
    let mut job_senders = Vec::with_capacity(k);
    let mut handles = Vec::with_capacity(k);

    for (mirror, addr) in addrs.iter().enumerate() {
        let (tx, rx) = mpsc::unbounded_channel::<MirrorJob>();
        job_senders.push(tx);
        handles.push(tokio::spawn(run_worker(
            mirror,
            *addr,
            rx,
            config.request_timeout,
            config.batch,
            blocksize,
            event_tx.clone(),
        )));
    }
    drop(event_tx);

    let mut live: HashSet<usize> = (0..k).collect();
    let mut reassign_cursor = 0usize;
    let mut output: HashMap<u32, Vec<u8>> = HashMap::with_capacity(total_blocks);
    let mut abort: Option<RaidPirError> = None;

    // On a multi-thread runtime a worker can connect, fail, and exit
    // before this synchronous loop finishes, so an initial send can race
    // a dead channel exactly like a later one - fall back to the same
    // reassignment path rather than dropping the job.
    let mut stillborn: HashMap<usize, Vec<MirrorJob>> = HashMap::new();
    for (mirror, (queries, labels)) in built
        .queries
        .into_iter()
        .zip(built.reply_labels.into_iter())
        .enumerate()
    {
        for (query, labels) in queries.into_iter().zip(labels.into_iter()) {
            let job = MirrorJob {
                origin: mirror,
                query,
                labels,
            };
            if let Err(mpsc::error::SendError(job)) = job_senders[mirror].send(job) {
                stillborn.entry(mirror).or_default().push(job);
            }
        }
    }
    for (mirror, jobs) in stillborn {
        live.remove(&mirror);
        if abort.is_none() {
            if let Err(e) = reassign_all(jobs, &mut live, &mut reassign_cursor, &job_senders) {
                abort = Some(e);
            }
        }
    }
    while abort.is_none() && output.len() < total_blocks {
        let event = match event_rx.recv().await {
            Some(e) => e,
            None => break,
        };
        match event {
            WorkerEvent::Replies {
                origin,
                labels,
                blocks,
            } => {
                if labels.len() != blocks.len() {
                    abort = Some(RaidPirError::ProtocolError(
                        "reply block count did not match expected label count".into(),
                    ));
                    break;
                }
                for (label, block) in labels.into_iter().zip(blocks.into_iter()) {
                    match reconstructor.contribute(origin, label, &block) {
                        Ok(Some(finished)) => {
                            if let Some(verify) = verify_block {
                                if !verify(label, &finished) {
                                    abort = Some(RaidPirError::BlockHashMismatch { index: label });
                                    break;
                                }
                            }
                            output.insert(label, finished);
                        }
                        Ok(None) => {}
                        Err(e) => {
                            abort = Some(e);
                            break;
                        }
                    }
                }
                if abort.is_some() {
                    break;
                }
            }
            WorkerEvent::Protocol { mirror, message } => {
                abort = Some(RaidPirError::ProtocolError(format!(
                    "mirror {}: {}",
                    mirror, message
                )));
                break;
            }
            WorkerEvent::Failed {
                dead_mirror,
                remaining,
            } => {
                warn!(
                    "mirror {} failed, reassigning {} pending job(s)",
                    dead_mirror,
                    remaining.len()
                );
                live.remove(&dead_mirror);
                if let Err(e) = reassign_all(remaining, &mut live, &mut reassign_cursor, &job_senders) {
                    abort = Some(e);
                    break;
                }
            }
        }
    }

    // No more new work will be produced; dropping the senders lets every
    // worker's receive loop end once its queue drains.
    drop(job_senders);

    let mut timings = Timings {
        per_mirror: Vec::with_capacity(k),
    };
    for handle in handles {
        let elapsed = handle
            .await
            .map_err(|e| RaidPirError::ProtocolError(format!("worker task panicked: {}", e)))?;
        timings.per_mirror.push(elapsed);
    }

    if let Some(e) = abort {
        return Err(e);
    }
    if output.len() != total_blocks {
        return Err(RaidPirError::MirrorUnavailable(
            "retrieval ended before every requested block was reconstructed".into(),
        ));
    }

    info!("retrieval complete: {} block(s) reconstructed", output.len());
    Ok((output.into_iter().collect(), timings))
}

fn reassign_all(
    remaining: Vec<MirrorJob>,
    live: &mut HashSet<usize>,
    cursor: &mut usize,
    job_senders: &[mpsc::UnboundedSender<MirrorJob>],
) -> Result<(), RaidPirError> {
    for job in remaining {
        let mut job = job;
        loop {
            let target = match pick_target(live, cursor) {
                Some(t) => t,
                None => {
                    return Err(RaidPirError::MirrorUnavailable(
                        "no live mirrors remain to satisfy the reconstruction plan".into(),
                    ))
                }
            };
            match job_senders[target].send(job) {
                Ok(()) => break,
                Err(mpsc::error::SendError(returned)) => {
                    live.remove(&target);
                    job = returned;
                }
            }
        }
    }
    Ok(())
}

fn pick_target(live: &HashSet<usize>, cursor: &mut usize) -> Option<usize> {
    if live.is_empty() {
        return None;
    }
    let mut sorted: Vec<usize> = live.iter().copied().collect();
    sorted.sort_unstable();
    let target = sorted[*cursor % sorted.len()];
    *cursor += 1;
    Some(target)
}

/// Runs one mirror's connection: blocks on `rx` for work, round-trips each
/// job, and reports results or failure back through `tx`. Per §4.C, stops
/// issuing requests the moment one fails, but keeps draining `rx` and
/// reporting every job it receives - present or still to arrive - as
/// failed until the coordinator drops every sender, so a job that races
/// the failure report can never be silently lost.
async fn run_worker(
    mirror: usize,
    addr: SocketAddr,
    mut rx: mpsc::UnboundedReceiver<MirrorJob>,
    request_timeout: Duration,
    batch: bool,
    blocksize: usize,
    tx: mpsc::UnboundedSender<WorkerEvent>,
) -> Duration {
    let mut total = Duration::ZERO;

    let mut stream = match TcpStream::connect(addr).await {
        Ok(s) => s,
        Err(e) => {
            warn!("mirror {} ({}): connect failed: {}", mirror, addr, e);
            fail_everything(mirror, &mut rx, &tx).await;
            return total;
        }
    };
    debug!("mirror {} ({}): connected", mirror, addr);

    while let Some(job) = rx.recv().await {
        let payload = job.query.encode(batch);
        let reply_count = protocol::expected_reply_count(&job.query);
        let started = Instant::now();

        let io = tokio_timeout(request_timeout, async {
            protocol::write_frame(&mut stream, &payload).await?;
            protocol::read_frame(&mut stream).await
        })
        .await;

        let frame = match io {
            Ok(Ok(frame)) => frame,
            Ok(Err(_)) | Err(_) => {
                let mut remaining = vec![job];
                drain_queued(&mut rx, &mut remaining);
                let _ = tx.send(WorkerEvent::Failed {
                    dead_mirror: mirror,
                    remaining,
                });
                fail_everything(mirror, &mut rx, &tx).await;
                return total;
            }
        };
        total += started.elapsed();

        if frame.len() != reply_count * blocksize {
            let _ = tx.send(WorkerEvent::Protocol {
                mirror,
                message: format!(
                    "expected {} bytes ({} blocks of {}), got {}",
                    reply_count * blocksize,
                    reply_count,
                    blocksize,
                    frame.len()
                ),
            });
            return total;
        }

        let blocks: Vec<Vec<u8>> = frame.chunks(blocksize).map(|c| c.to_vec()).collect();
        let _ = tx.send(WorkerEvent::Replies {
            origin: job.origin,
            labels: job.labels,
            blocks,
        });
    }

    total
}

async fn fail_everything(
    mirror: usize,
    rx: &mut mpsc::UnboundedReceiver<MirrorJob>,
    tx: &mpsc::UnboundedSender<WorkerEvent>,
) {
    // Report right away, even if nothing is queued yet, so the
    // coordinator learns this mirror is dead and stops routing new work
    // here as soon as possible.
    let mut remaining = Vec::new();
    drain_queued(rx, &mut remaining);
    let _ = tx.send(WorkerEvent::Failed {
        dead_mirror: mirror,
        remaining,
    });

    // A job can still land in this queue between the drain above and the
    // coordinator acting on the event it just received (removing this
    // mirror from its live set) - `send()` only errors once the receiver
    // is actually gone, not once the coordinator has decided to stop
    // using it. Rather than return here and risk such a job sitting in a
    // channel nobody ever reads again, keep receiving and reporting every
    // later arrival as failed too, exactly as a live worker keeps
    // receiving until the coordinator drops every sender.
    while let Some(job) = rx.recv().await {
        let _ = tx.send(WorkerEvent::Failed {
            dead_mirror: mirror,
            remaining: vec![job],
        });
    }
}

fn drain_queued(rx: &mut mpsc::UnboundedReceiver<MirrorJob>, into: &mut Vec<MirrorJob>) {
    while let Ok(job) = rx.try_recv() {
        into.push(job);
    }
}
