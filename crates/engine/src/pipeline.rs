//! Single-pass update pipeline: fetch, verify, decompress, stage, commit.
//!
//! The payload is never materialized whole. One forward pass over the
//! source archive drives the whole chain:
//!
//! ```text
//! source -> progress counter -> tar walk -> signature tee -> xz -> sink
//! ```
//!
//! The verifier sits before decompression, so the verdict covers the bytes
//! as shipped. A snapshot staged from an unverified stream is deleted
//! before `Failed` is reported; `Completed` is only ever reported after
//! `finalize` returned.

use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};

use async_compression::tokio::bufread::XzDecoder;
use futures::StreamExt;
use sprout_errors::{Error, NetworkError, SigningError, UpdateError};
use sprout_events::{UpdateStatus, PROGRESS_UNKNOWN};
use sprout_net::{SourceFetcher, UpdateSource};
use sprout_signing::{StreamingVerifier, VerificationOutcome, VerifierFactory};
use sprout_snapshot::SnapshotSink;
use tokio::io::{AsyncRead, AsyncReadExt, BufReader, ReadBuf};
use tokio_tar::Archive;
use tracing::{error, info, warn};

use crate::archive::{extract_version, CHANGELOG_MEMBER, PAYLOAD_MEMBER, SIGNATURE_MEMBER};
use crate::gate::{ConfirmationGate, PendingUpdate};
use crate::progress::{ProgressReader, ProgressShared};
use crate::status::StatusMachine;
use crate::verify_stream::VerifyingReader;

/// Metadata members are small text files; anything bigger is a sign the
/// archive was authored wrong.
const MAX_METADATA_MEMBER: u64 = 1024 * 1024;

/// Everything one cycle needs besides the source itself.
pub(crate) struct PipelineContext {
    pub machine: Arc<StatusMachine>,
    pub gate: Arc<ConfirmationGate>,
    pub sink: Arc<dyn SnapshotSink>,
    pub verifiers: Arc<dyn VerifierFactory>,
    pub auto_install: bool,
}

/// Run one full update cycle and report its outcome on the status machine.
///
/// The caller has already claimed the machine (status is `Downloading`).
/// Whatever happens inside, this function leaves the machine in `Idle`,
/// `Completed` or `Failed`.
pub(crate) async fn run(ctx: PipelineContext, fetcher: SourceFetcher, source: UpdateSource) {
    let desc = source.describe();
    match run_cycle(&ctx, &fetcher, &source, &desc).await {
        Ok(CycleOutcome::Committed { snapshot }) => {
            info!(source = %desc, %snapshot, "update installed");
        }
        Ok(CycleOutcome::Rejected { snapshot }) => {
            info!(source = %desc, %snapshot, "update rejected and cleared");
        }
        Err(err) => {
            error!(source = %desc, %err, "update cycle failed");
            ctx.machine.report(
                UpdateStatus::Failed,
                format!("{desc}: {err}"),
                PROGRESS_UNKNOWN,
            );
        }
    }
}

enum CycleOutcome {
    Committed { snapshot: String },
    Rejected { snapshot: String },
}

async fn run_cycle(
    ctx: &PipelineContext,
    fetcher: &SourceFetcher,
    source: &UpdateSource,
    desc: &str,
) -> Result<CycleOutcome, Error> {
    let (stream, total) = fetcher.open(source).await?;

    let reader = ProgressReader::new(stream, total, Arc::clone(&ctx.machine));
    let progress = reader.shared();

    let mut archive = Archive::new(reader);
    let mut entries = archive.entries().map_err(corrupt)?;

    let mut changelog: Option<String> = None;
    let mut signature: Option<String> = None;
    let mut outcome: Option<CycleOutcome> = None;

    while let Some(entry) = entries.next().await {
        let mut entry = entry.map_err(corrupt)?;
        let path = entry.path().map_err(corrupt)?;
        let name = path.to_string_lossy().into_owned();
        let name = name.strip_prefix("./").unwrap_or(&name).to_string();

        match name.as_str() {
            CHANGELOG_MEMBER => {
                changelog = Some(read_metadata_member(&mut entry, &name).await?);
            }
            SIGNATURE_MEMBER => {
                signature = Some(read_metadata_member(&mut entry, &name).await?);
            }
            PAYLOAD_MEMBER => {
                // Metadata must precede the payload; a single forward pass
                // cannot go back for it.
                let changelog = changelog.clone().ok_or_else(|| missing(CHANGELOG_MEMBER))?;
                let signature = signature.clone().ok_or_else(|| missing(SIGNATURE_MEMBER))?;
                let verifier = ctx.verifiers.open(&signature);
                outcome = Some(
                    stage_and_commit(ctx, desc, entry, verifier, &changelog, &progress).await?,
                );
                // The cycle is settled; reading trailing blocks would only
                // publish stale progress after the final record.
                break;
            }
            other => {
                // Unknown members are skipped, not fatal. The walk skips
                // their bytes on the next iteration.
                warn!(member = other, "ignoring unexpected archive member");
            }
        }
    }

    outcome.ok_or_else(|| missing(PAYLOAD_MEMBER))
}

/// Stream the payload member into the sink, then settle the verdict.
async fn stage_and_commit<R>(
    ctx: &PipelineContext,
    desc: &str,
    payload: R,
    verifier: Box<dyn StreamingVerifier>,
    changelog: &str,
    progress: &Arc<ProgressShared>,
) -> Result<CycleOutcome, Error>
where
    R: AsyncRead + Send + Unpin + 'static,
{
    let verifying = VerifyingReader::new(payload, verifier);
    let verdict = verifying.verifier();
    let source_tap = ErrorTap::new(verifying);
    let source_fault = source_tap.fault();
    let decoder = ErrorTap::new(XzDecoder::new(BufReader::new(source_tap)));
    let decode_fault = decoder.fault();

    ctx.machine.report(
        UpdateStatus::Installing,
        format!("receiving image from {desc}"),
        progress.percentage(),
    );

    let snapshot = match ctx.sink.receive(Box::new(decoder)).await {
        Ok(snapshot) => snapshot,
        Err(sink_err) => {
            return Err(classify_receive_error(&source_fault, &decode_fault, sink_err))
        }
    };

    // End of payload stream: the verifier has now seen every byte.
    let outcome = verdict.lock().unwrap().finalize();
    if let Err(err) = check_verdict(outcome) {
        // The staged snapshot came from an unverified stream; it must be
        // gone before Failed is reported.
        if let Err(cleanup) = ctx.sink.discard(&snapshot).await {
            error!(%snapshot, %cleanup, "failed to clear unverified snapshot");
        }
        return Err(err);
    }
    progress.finish();

    if ctx.auto_install {
        return commit(ctx, desc, &snapshot).await;
    }

    let version = extract_version(changelog);
    let decision = ctx.gate.park(PendingUpdate {
        version: version.clone(),
        changelog: changelog.to_string(),
        source: desc.to_string(),
        staged_snapshot: snapshot.clone(),
    });
    ctx.machine.report(
        UpdateStatus::AwaitingConfirmation,
        format!("{version} staged from {desc}"),
        PROGRESS_UNKNOWN,
    );

    match decision.await {
        Ok(true) => commit(ctx, desc, &snapshot).await,
        Ok(false) => {
            ctx.machine.report(
                UpdateStatus::Clearing,
                format!("clearing rejected update {version}"),
                PROGRESS_UNKNOWN,
            );
            ctx.sink.discard(&snapshot).await?;
            ctx.machine
                .report(UpdateStatus::Idle, "", PROGRESS_UNKNOWN);
            Ok(CycleOutcome::Rejected { snapshot })
        }
        Err(_) => {
            if let Err(cleanup) = ctx.sink.discard(&snapshot).await {
                error!(%snapshot, %cleanup, "failed to clear abandoned snapshot");
            }
            Err(Error::internal("confirmation gate closed mid-cycle"))
        }
    }
}

async fn commit(ctx: &PipelineContext, desc: &str, snapshot: &str) -> Result<CycleOutcome, Error> {
    ctx.machine.report(
        UpdateStatus::Installing,
        format!("finalizing {snapshot}"),
        ctx.machine.current().progress,
    );
    if let Err(err) = ctx.sink.finalize(snapshot).await {
        // A half-finalized subvolume is not the boot target; leave it to
        // the startup sweep if the delete fails too.
        if let Err(cleanup) = ctx.sink.discard(snapshot).await {
            warn!(snapshot, %cleanup, "failed to clear snapshot after finalize error");
        }
        return Err(err);
    }
    ctx.machine.report(
        UpdateStatus::Completed,
        format!("{desc} installed as {snapshot}"),
        PROGRESS_UNKNOWN,
    );
    Ok(CycleOutcome::Committed {
        snapshot: snapshot.to_string(),
    })
}

fn check_verdict(outcome: VerificationOutcome) -> Result<(), Error> {
    match outcome {
        VerificationOutcome::Valid => Ok(()),
        VerificationOutcome::Invalid => Err(SigningError::VerificationFailed(
            "payload signature does not match the trusted key".to_string(),
        )
        .into()),
        VerificationOutcome::Undetermined(reason) => {
            Err(SigningError::Undetermined(reason).into())
        }
    }
}

async fn read_metadata_member<R>(entry: &mut R, name: &str) -> Result<String, Error>
where
    R: AsyncRead + Unpin,
{
    let mut content = String::new();
    entry
        .take(MAX_METADATA_MEMBER + 1)
        .read_to_string(&mut content)
        .await
        .map_err(|e| UpdateError::CorruptArchive {
            message: format!("unreadable {name} member: {e}"),
        })?;
    if content.len() as u64 > MAX_METADATA_MEMBER {
        return Err(UpdateError::CorruptArchive {
            message: format!("{name} member exceeds {MAX_METADATA_MEMBER} bytes"),
        }
        .into());
    }
    Ok(content)
}

type Fault = Arc<Mutex<Option<String>>>;

/// `AsyncRead` wrapper that remembers the first read error it passes on.
///
/// Everything that goes wrong while the sink pulls the stream surfaces as
/// a sink error; one tap under and one tap over the decompressor restore
/// the stage that actually failed.
struct ErrorTap<R> {
    inner: R,
    fault: Fault,
}

impl<R> ErrorTap<R> {
    fn new(inner: R) -> Self {
        Self {
            inner,
            fault: Arc::new(Mutex::new(None)),
        }
    }

    fn fault(&self) -> Fault {
        Arc::clone(&self.fault)
    }
}

impl<R: AsyncRead + Unpin> AsyncRead for ErrorTap<R> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        match Pin::new(&mut self.inner).poll_read(cx, buf) {
            Poll::Ready(Err(e)) => {
                let mut fault = self.fault.lock().unwrap();
                if fault.is_none() {
                    *fault = Some(e.to_string());
                }
                drop(fault);
                Poll::Ready(Err(e))
            }
            other => other,
        }
    }
}

/// A source-side error (it also reaches the decoder tap on its way out)
/// means the fetch broke; a decoder error over a clean source means the
/// payload would not decompress; otherwise the sink itself failed.
fn classify_receive_error(source_fault: &Fault, decode_fault: &Fault, sink_err: Error) -> Error {
    let source = source_fault.lock().unwrap().take();
    let decode = decode_fault.lock().unwrap().take();
    match (source, decode) {
        (Some(message), _) => NetworkError::DownloadFailed(message).into(),
        (None, Some(message)) => UpdateError::DecompressionFailed { message }.into(),
        (None, None) => sink_err,
    }
}

fn corrupt(err: std::io::Error) -> Error {
    UpdateError::CorruptArchive {
        message: err.to_string(),
    }
    .into()
}

fn missing(name: &str) -> Error {
    UpdateError::MissingMember {
        name: name.to_string(),
    }
    .into()
}
