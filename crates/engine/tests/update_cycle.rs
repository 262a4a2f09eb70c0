//! End-to-end update cycles against an in-memory snapshot sink.
//!
//! Archives are real tar files with an xz-compressed payload; only the
//! signature verdict and the snapshot backend are test doubles, since a
//! verify-only crate cannot produce signatures and btrfs needs root.

use std::io::Write;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use sprout_config::Config;
use sprout_engine::UpdateService;
use sprout_errors::{Error, SnapshotError, UpdateError};
use sprout_events::{StatusRecord, StatusSubscription, UpdateStatus, PROGRESS_UNKNOWN};
use sprout_signing::{StreamingVerifier, VerificationOutcome, VerifierFactory};
use sprout_snapshot::SnapshotSink;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;
use tokio::sync::Semaphore;
use tokio::time::timeout;

const CHANGELOG: &str = "Version 2.1.0\n- streaming updates\n- faster boots\n";
const SIGNATURE: &str = "untrusted comment: test signature\nRUQAtest\n";
const PAYLOAD: &[u8] = b"pretend this is a filesystem image, repeated enough to compress";

// ---------------------------------------------------------------------------
// test doubles

struct MockSink {
    received: Mutex<Vec<Vec<u8>>>,
    finalized: Mutex<Vec<String>>,
    discarded: Mutex<Vec<String>>,
    staged_count: AtomicUsize,
    hold: Option<Arc<Semaphore>>,
}

impl MockSink {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            received: Mutex::new(Vec::new()),
            finalized: Mutex::new(Vec::new()),
            discarded: Mutex::new(Vec::new()),
            staged_count: AtomicUsize::new(0),
            hold: None,
        })
    }

    /// A sink whose `receive` blocks until a permit is added, keeping the
    /// cycle in flight for as long as the test needs.
    fn gated() -> (Arc<Self>, Arc<Semaphore>) {
        let gate = Arc::new(Semaphore::new(0));
        let sink = Arc::new(Self {
            received: Mutex::new(Vec::new()),
            finalized: Mutex::new(Vec::new()),
            discarded: Mutex::new(Vec::new()),
            staged_count: AtomicUsize::new(0),
            hold: Some(Arc::clone(&gate)),
        });
        (sink, gate)
    }

    fn finalized(&self) -> Vec<String> {
        self.finalized.lock().unwrap().clone()
    }

    fn discarded(&self) -> Vec<String> {
        self.discarded.lock().unwrap().clone()
    }

    fn received(&self) -> Vec<Vec<u8>> {
        self.received.lock().unwrap().clone()
    }
}

#[async_trait]
impl SnapshotSink for MockSink {
    async fn receive(
        &self,
        mut stream: Box<dyn AsyncRead + Send + Unpin>,
    ) -> Result<String, Error> {
        if let Some(gate) = &self.hold {
            let _permit = gate
                .acquire()
                .await
                .map_err(|_| Error::internal("test gate closed"))?;
        }
        let mut image = Vec::new();
        stream
            .read_to_end(&mut image)
            .await
            .map_err(|e| SnapshotError::ReceiveFailed {
                message: e.to_string(),
            })?;
        let n = self.staged_count.fetch_add(1, Ordering::SeqCst);
        self.received.lock().unwrap().push(image);
        Ok(format!("deployment-{n}"))
    }

    async fn finalize(&self, name: &str) -> Result<(), Error> {
        self.finalized.lock().unwrap().push(name.to_string());
        Ok(())
    }

    async fn discard(&self, name: &str) -> Result<(), Error> {
        self.discarded.lock().unwrap().push(name.to_string());
        Ok(())
    }

    async fn sweep_staged(&self) -> Result<Vec<String>, Error> {
        Ok(Vec::new())
    }
}

/// Factory whose verifiers ignore the bytes and return a fixed verdict.
struct StaticVerifiers(VerificationOutcome);

struct StaticVerifier(Option<VerificationOutcome>);

impl StreamingVerifier for StaticVerifier {
    fn update(&mut self, _data: &[u8]) {}

    fn finalize(&mut self) -> VerificationOutcome {
        self.0
            .take()
            .unwrap_or(VerificationOutcome::Undetermined("double finalize".into()))
    }
}

impl VerifierFactory for StaticVerifiers {
    fn open(&self, _signature_text: &str) -> Box<dyn StreamingVerifier> {
        Box::new(StaticVerifier(Some(self.0.clone())))
    }
}

// ---------------------------------------------------------------------------
// fixtures

async fn xz_compress(data: &[u8]) -> Vec<u8> {
    let mut encoder = async_compression::tokio::bufread::XzEncoder::new(BufReader::new(data));
    let mut out = Vec::new();
    encoder.read_to_end(&mut out).await.unwrap();
    out
}

fn append_member(builder: &mut tar::Builder<Vec<u8>>, name: &str, data: &[u8]) {
    let mut header = tar::Header::new_gnu();
    header.set_size(data.len() as u64);
    header.set_mode(0o644);
    header.set_cksum();
    builder.append_data(&mut header, name, data).unwrap();
}

fn build_archive(members: &[(&str, &[u8])]) -> tempfile::NamedTempFile {
    let mut builder = tar::Builder::new(Vec::new());
    for (name, data) in members {
        append_member(&mut builder, name, data);
    }
    let bytes = builder.into_inner().unwrap();
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(&bytes).unwrap();
    file.flush().unwrap();
    file
}

async fn standard_archive() -> tempfile::NamedTempFile {
    let payload = xz_compress(PAYLOAD).await;
    build_archive(&[
        ("CHANGELOG", CHANGELOG.as_bytes()),
        ("update.img.xz.minisig", SIGNATURE.as_bytes()),
        ("update.img.xz", &payload),
    ])
}

/// Serve exactly one HTTP response on an ephemeral port and return the URL.
///
/// The response head carries no `Content-Length`; the body is framed by
/// `Connection: close`, so the client sees a download of unknown size.
async fn serve_once(head: &'static str, body: Vec<u8>) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let (mut conn, _) = listener.accept().await.unwrap();
        let mut request = [0u8; 4096];
        let mut filled = 0;
        loop {
            let n = conn.read(&mut request[filled..]).await.unwrap();
            filled += n;
            if n == 0 || request[..filled].windows(4).any(|w| w == b"\r\n\r\n") {
                break;
            }
        }
        conn.write_all(head.as_bytes()).await.unwrap();
        conn.write_all(&body).await.unwrap();
        conn.shutdown().await.unwrap();
    });
    format!("http://{addr}/update.tar")
}

fn config(auto_install: bool) -> Config {
    Config::from_toml(&format!("[updates]\nauto_install = {auto_install}\n")).unwrap()
}

async fn service(
    auto_install: bool,
    sink: Arc<MockSink>,
    verdict: VerificationOutcome,
) -> UpdateService {
    UpdateService::new(
        &config(auto_install),
        sink,
        Arc::new(StaticVerifiers(verdict)),
    )
    .await
    .unwrap()
}

// ---------------------------------------------------------------------------
// helpers

async fn next_record(sub: &mut StatusSubscription) -> StatusRecord {
    timeout(Duration::from_secs(10), sub.recv())
        .await
        .expect("timed out waiting for a status record")
        .expect("status bus closed unexpectedly")
}

/// Collect records until `last` is observed (inclusive).
async fn drain_until(sub: &mut StatusSubscription, last: UpdateStatus) -> Vec<StatusRecord> {
    let mut records = Vec::new();
    loop {
        let record = next_record(sub).await;
        let done = record.status == last;
        records.push(record);
        if done {
            return records;
        }
    }
}

fn status_sequence(records: &[StatusRecord]) -> Vec<UpdateStatus> {
    let mut out: Vec<UpdateStatus> = Vec::new();
    for record in records {
        if out.last() != Some(&record.status) {
            out.push(record.status);
        }
    }
    out
}

// ---------------------------------------------------------------------------
// cycles

#[tokio::test]
async fn valid_update_auto_installs() {
    let archive = standard_archive().await;
    let sink = MockSink::new();
    let service = service(true, Arc::clone(&sink), VerificationOutcome::Valid).await;
    let mut sub = service.subscribe();

    let ack = service.install_from_file(archive.path()).unwrap();
    assert!(ack.contains("started"));

    let records = drain_until(&mut sub, UpdateStatus::Completed).await;
    assert_eq!(
        status_sequence(&records),
        vec![
            UpdateStatus::Downloading,
            UpdateStatus::Installing,
            UpdateStatus::Completed
        ]
    );

    // Progress reached 100 before the terminal record, which carries the
    // sentinel again.
    assert!(records.iter().any(|r| r.progress == 100));
    assert_eq!(records.last().unwrap().progress, PROGRESS_UNKNOWN);

    // Progress never goes backwards within the cycle.
    let observed: Vec<i32> = records
        .iter()
        .filter(|r| !r.is_terminal())
        .map(|r| r.progress)
        .collect();
    assert!(observed.windows(2).all(|w| w[0] <= w[1]), "{observed:?}");

    // The staged image is the decompressed payload, committed exactly once.
    assert_eq!(sink.received(), vec![PAYLOAD.to_vec()]);
    assert_eq!(sink.finalized(), vec!["deployment-0".to_string()]);
    assert!(sink.discarded().is_empty());

    // Polling with no intervening activity is idempotent.
    assert_eq!(service.status(), service.status());
    assert_eq!(service.status().status, UpdateStatus::Completed);
}

#[tokio::test]
async fn invalid_signature_discards_before_failing() {
    let archive = standard_archive().await;
    let sink = MockSink::new();
    let service = service(true, Arc::clone(&sink), VerificationOutcome::Invalid).await;
    let mut sub = service.subscribe();

    service.install_from_file(archive.path()).unwrap();
    let records = drain_until(&mut sub, UpdateStatus::Failed).await;

    // Failed is published only after the unverified snapshot is gone.
    assert_eq!(sink.discarded(), vec!["deployment-0".to_string()]);
    assert!(sink.finalized().is_empty());
    let failed = records.last().unwrap();
    assert!(failed.details.contains("signature"), "{}", failed.details);

    // A terminal state accepts the next request.
    service.install_from_file(archive.path()).unwrap();
    drain_until(&mut sub, UpdateStatus::Failed).await;
}

#[tokio::test]
async fn undetermined_verdict_fails_closed() {
    let archive = standard_archive().await;
    let sink = MockSink::new();
    let service = service(
        true,
        Arc::clone(&sink),
        VerificationOutcome::Undetermined("legacy signature".into()),
    )
    .await;
    let mut sub = service.subscribe();

    service.install_from_file(archive.path()).unwrap();
    drain_until(&mut sub, UpdateStatus::Failed).await;

    assert_eq!(sink.discarded().len(), 1);
    assert!(sink.finalized().is_empty());
}

#[tokio::test]
async fn confirmation_accept_commits() {
    let archive = standard_archive().await;
    let sink = MockSink::new();
    let service = service(false, Arc::clone(&sink), VerificationOutcome::Valid).await;
    let mut sub = service.subscribe();

    service.install_from_file(archive.path()).unwrap();
    drain_until(&mut sub, UpdateStatus::AwaitingConfirmation).await;

    let pending = service.pending_update().unwrap();
    assert_eq!(pending.version, "2.1.0");
    assert_eq!(pending.changelog, CHANGELOG);
    assert_eq!(pending.staged_snapshot, "deployment-0");
    assert!(sink.finalized().is_empty());

    // Parked cycles still count as in progress.
    assert!(matches!(
        service.install_from_file(archive.path()),
        Err(Error::Update(UpdateError::AlreadyInProgress))
    ));

    service.confirm_update(true).unwrap();
    let records = drain_until(&mut sub, UpdateStatus::Completed).await;
    assert!(status_sequence(&records).contains(&UpdateStatus::Installing));
    assert_eq!(sink.finalized(), vec!["deployment-0".to_string()]);

    // Single consumption: the decision is gone.
    assert!(matches!(
        service.pending_update(),
        Err(Error::Update(UpdateError::NoPendingUpdate))
    ));
    assert!(matches!(
        service.confirm_update(false),
        Err(Error::Update(UpdateError::AlreadyResolved))
    ));
}

#[tokio::test]
async fn confirmation_reject_clears_and_returns_to_idle() {
    let archive = standard_archive().await;
    let sink = MockSink::new();
    let service = service(false, Arc::clone(&sink), VerificationOutcome::Valid).await;
    let mut sub = service.subscribe();

    service.install_from_file(archive.path()).unwrap();
    drain_until(&mut sub, UpdateStatus::AwaitingConfirmation).await;

    service.confirm_update(false).unwrap();
    let records = drain_until(&mut sub, UpdateStatus::Idle).await;
    let tail = status_sequence(&records);
    assert!(tail.ends_with(&[UpdateStatus::Clearing, UpdateStatus::Idle]));

    assert_eq!(sink.discarded(), vec!["deployment-0".to_string()]);
    assert!(sink.finalized().is_empty());
    assert!(matches!(
        service.pending_update(),
        Err(Error::Update(UpdateError::NoPendingUpdate))
    ));

    // Idle again: a fresh cycle may start.
    service.install_from_file(archive.path()).unwrap();
    drain_until(&mut sub, UpdateStatus::AwaitingConfirmation).await;
}

#[tokio::test]
async fn concurrent_install_is_rejected_without_side_effects() {
    let archive = standard_archive().await;
    let (sink, gate) = MockSink::gated();
    let service = service(true, Arc::clone(&sink), VerificationOutcome::Valid).await;
    let mut sub = service.subscribe();

    service.install_from_file(archive.path()).unwrap();
    drain_until(&mut sub, UpdateStatus::Installing).await;

    // The first cycle is parked inside the sink; a second request must
    // bounce without touching it.
    assert!(matches!(
        service.install_from_file(archive.path()),
        Err(Error::Update(UpdateError::AlreadyInProgress))
    ));

    gate.add_permits(1);
    drain_until(&mut sub, UpdateStatus::Completed).await;
    assert_eq!(sink.received().len(), 1);
    assert_eq!(sink.finalized().len(), 1);
}

// ---------------------------------------------------------------------------
// malformed archives

#[tokio::test]
async fn missing_payload_member_fails_without_staging() {
    let archive = build_archive(&[
        ("CHANGELOG", CHANGELOG.as_bytes()),
        ("update.img.xz.minisig", SIGNATURE.as_bytes()),
    ]);
    let sink = MockSink::new();
    let service = service(true, Arc::clone(&sink), VerificationOutcome::Valid).await;
    let mut sub = service.subscribe();

    service.install_from_file(archive.path()).unwrap();
    let records = drain_until(&mut sub, UpdateStatus::Failed).await;

    assert!(records.last().unwrap().details.contains("update.img.xz"));
    assert!(sink.received().is_empty());
    assert!(sink.discarded().is_empty());
}

#[tokio::test]
async fn metadata_after_payload_fails() {
    // Single forward pass: metadata arriving after the payload is useless.
    let payload = xz_compress(PAYLOAD).await;
    let archive = build_archive(&[
        ("update.img.xz", &payload),
        ("CHANGELOG", CHANGELOG.as_bytes()),
        ("update.img.xz.minisig", SIGNATURE.as_bytes()),
    ]);
    let sink = MockSink::new();
    let service = service(true, Arc::clone(&sink), VerificationOutcome::Valid).await;
    let mut sub = service.subscribe();

    service.install_from_file(archive.path()).unwrap();
    let records = drain_until(&mut sub, UpdateStatus::Failed).await;

    assert!(records.last().unwrap().details.contains("CHANGELOG"));
    assert!(sink.received().is_empty());
}

#[tokio::test]
async fn unknown_members_are_ignored() {
    let payload = xz_compress(PAYLOAD).await;
    let archive = build_archive(&[
        ("README", b"not part of the protocol"),
        ("CHANGELOG", CHANGELOG.as_bytes()),
        ("update.img.xz.minisig", SIGNATURE.as_bytes()),
        ("update.img.xz", &payload),
    ]);
    let sink = MockSink::new();
    let service = service(true, Arc::clone(&sink), VerificationOutcome::Valid).await;
    let mut sub = service.subscribe();

    service.install_from_file(archive.path()).unwrap();
    drain_until(&mut sub, UpdateStatus::Completed).await;
    assert_eq!(sink.received(), vec![PAYLOAD.to_vec()]);
}

#[tokio::test]
async fn corrupt_payload_fails_the_cycle() {
    // Not xz at all; the decoder errors mid-receive.
    let archive = build_archive(&[
        ("CHANGELOG", CHANGELOG.as_bytes()),
        ("update.img.xz.minisig", SIGNATURE.as_bytes()),
        ("update.img.xz", b"definitely not xz data"),
    ]);
    let sink = MockSink::new();
    let service = service(true, Arc::clone(&sink), VerificationOutcome::Valid).await;
    let mut sub = service.subscribe();

    service.install_from_file(archive.path()).unwrap();
    let records = drain_until(&mut sub, UpdateStatus::Failed).await;
    let failed = records.last().unwrap();
    // Blame lands on the decoder, not on the sink that happened to see it.
    assert!(failed.details.contains("decompression failed"));
    assert!(!failed.details.contains("snapshot"));
    assert!(sink.finalized().is_empty());
}

#[tokio::test]
async fn missing_source_file_fails_cleanly() {
    let sink = MockSink::new();
    let service = service(true, Arc::clone(&sink), VerificationOutcome::Valid).await;
    let mut sub = service.subscribe();

    service
        .install_from_file("/nonexistent/update.tar")
        .unwrap();
    let records = drain_until(&mut sub, UpdateStatus::Failed).await;
    assert!(records.last().unwrap().details.contains("not found"));
    assert!(sink.received().is_empty());
}

// ---------------------------------------------------------------------------
// URL sources

#[tokio::test]
async fn url_download_without_content_length_reports_unknown_progress() {
    let archive = standard_archive().await;
    let bytes = std::fs::read(archive.path()).unwrap();
    let url = serve_once("HTTP/1.1 200 OK\r\nConnection: close\r\n\r\n", bytes).await;

    let sink = MockSink::new();
    let service = service(true, Arc::clone(&sink), VerificationOutcome::Valid).await;
    let mut sub = service.subscribe();

    service.install_from_url(url).unwrap();
    let records = drain_until(&mut sub, UpdateStatus::Completed).await;

    assert_eq!(
        status_sequence(&records),
        vec![
            UpdateStatus::Downloading,
            UpdateStatus::Installing,
            UpdateStatus::Completed,
        ]
    );
    // No declared size, so the percentage stays unknown for the whole cycle.
    assert!(records.iter().all(|r| r.progress == PROGRESS_UNKNOWN));
    assert_eq!(sink.received(), vec![PAYLOAD.to_vec()]);
    assert_eq!(sink.finalized(), vec!["deployment-0".to_string()]);
}

#[tokio::test]
async fn url_error_status_fails_the_cycle() {
    let url = serve_once(
        "HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\n\r\n",
        Vec::new(),
    )
    .await;

    let sink = MockSink::new();
    let service = service(true, Arc::clone(&sink), VerificationOutcome::Valid).await;
    let mut sub = service.subscribe();

    service.install_from_url(url).unwrap();
    let records = drain_until(&mut sub, UpdateStatus::Failed).await;
    assert!(records.last().unwrap().details.contains("HTTP error 404"));
    assert!(sink.received().is_empty());
}
