//! Package Handler: the concurrency core (§4.2, §5, §9).
//!
//! Two logical tasks run per connection once [`PackageHandler::start_all`]
//! is called: the obtain loop (reads frames, dispatches internal packages to
//! `on_internal` awaited, data packages to `on_data` fire-and-forget) and
//! the dispatch loop (drains the outgoing queue, writes, signals
//! completion). Both honor a manual-reset pause gate and a shared
//! cancellation token. Before the loops are started (and while they are
//! paused, e.g. mid-Panic-recovery), callers can still read/write directly
//! through [`PackageHandler::obtain`]/[`PackageHandler::dispatch`] — the
//! reader and writer halves are held behind their own mutex so direct and
//! looped access never race.

use crate::codec::{
    read_package_expect_any, read_package_expect_one, write_package, Package, PackageType,
};
use crate::error::{CodecError, HandlerErrorKind};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot, Mutex as AsyncMutex, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Callbacks invoked by the obtain loop (§4.2). `on_data` is fire-and-forget
/// ("not awaited"); `on_internal` and `on_error` are awaited so inbound
/// packages within one connection process strictly in arrival order (§5).
#[async_trait]
pub trait PackageCallbacks: Send + Sync + 'static {
    async fn on_internal(&self, pkg: Package);
    fn on_data(&self, pkg: Package);
    async fn on_error(&self, kind: HandlerErrorKind);
}

/// A manual-reset gate: open lets waiters through immediately, closed parks
/// them until reopened or the shared token cancels (§4.2, §9). Modeled with
/// a `Notify` rather than tokio's auto-reset primitives because every
/// waiter — not just one — must wake on `open()`.
struct Gate {
    open: AtomicBool,
    notify: Notify,
}

impl Gate {
    fn new(initially_open: bool) -> Self {
        Self {
            open: AtomicBool::new(initially_open),
            notify: Notify::new(),
        }
    }

    async fn wait(&self, cancel: &CancellationToken) {
        loop {
            if self.open.load(Ordering::Acquire) || cancel.is_cancelled() {
                return;
            }
            tokio::select! {
                _ = self.notify.notified() => {}
                _ = cancel.cancelled() => return,
            }
        }
    }

    fn open_gate(&self) {
        self.open.store(true, Ordering::Release);
        self.notify.notify_waiters();
    }

    fn close_gate(&self) {
        self.open.store(false, Ordering::Release);
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }
}

fn classify_codec_error(err: &CodecError) -> HandlerErrorKind {
    match err {
        CodecError::Timeout => HandlerErrorKind::ReadTimeout,
        // A clean EOF mid-frame means the peer closed the stream rather than
        // the socket breaking underneath us (§7: "disconnected - peer
        // indicated disconnect or stream ended cleanly").
        CodecError::StreamBroken(io_err)
            if io_err.kind() == std::io::ErrorKind::UnexpectedEof =>
        {
            HandlerErrorKind::Disconnected
        }
        CodecError::StreamBroken(_) => HandlerErrorKind::CannotRead,
        CodecError::ErrorPackage => HandlerErrorKind::ErrorPackage,
        CodecError::Unexpected { .. } => HandlerErrorKind::UnexpectedPackage,
        CodecError::NegativeLength | CodecError::LengthCapExceeded(_, _) => {
            HandlerErrorKind::IncorrectPackage
        }
    }
}

/// The package handler itself (§4.2).
pub struct PackageHandler<R, W, Cb> {
    reader: Arc<AsyncMutex<R>>,
    writer: Arc<AsyncMutex<W>>,
    queue_tx: mpsc::UnboundedSender<Package>,
    queue_rx: AsyncMutex<Option<mpsc::UnboundedReceiver<Package>>>,
    cancel: CancellationToken,
    obtain_gate: Arc<Gate>,
    dispatch_gate: Arc<Gate>,
    pause_mutex: Arc<AsyncMutex<()>>,
    tasks: AsyncMutex<Vec<JoinHandle<()>>>,
    callbacks: Arc<Cb>,
    receive_timeout: Duration,
    max_payload: usize,
    drain_on_stop: Arc<AtomicBool>,
}

impl<R, W, Cb> PackageHandler<R, W, Cb>
where
    R: AsyncReadExt + Unpin + Send + 'static,
    W: AsyncWriteExt + Unpin + Send + 'static,
    Cb: PackageCallbacks,
{
    pub fn new(
        reader: R,
        writer: W,
        callbacks: Arc<Cb>,
        receive_timeout: Duration,
        max_payload: usize,
    ) -> Self {
        let (queue_tx, queue_rx) = mpsc::unbounded_channel();
        Self {
            reader: Arc::new(AsyncMutex::new(reader)),
            writer: Arc::new(AsyncMutex::new(writer)),
            queue_tx,
            queue_rx: AsyncMutex::new(Some(queue_rx)),
            cancel: CancellationToken::new(),
            obtain_gate: Arc::new(Gate::new(true)),
            dispatch_gate: Arc::new(Gate::new(true)),
            pause_mutex: Arc::new(AsyncMutex::new(())),
            tasks: AsyncMutex::new(Vec::new()),
            callbacks,
            receive_timeout,
            max_payload,
            drain_on_stop: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Enqueues `pkg` for the dispatch loop without waiting for the write
    /// (§4.2 `send`).
    pub fn send(&self, pkg: Package) -> Result<(), HandlerErrorKind> {
        self.queue_tx
            .send(pkg)
            .map_err(|_| HandlerErrorKind::Disconnected)
    }

    /// Enqueues `pkg` and waits for the dispatch loop to confirm the write
    /// (§4.2 `send_await`, §9 completion notifier).
    pub async fn send_await(&self, mut pkg: Package) -> Result<(), HandlerErrorKind> {
        let (tx, rx) = oneshot::channel();
        pkg.completion = Some(tx);
        self.send(pkg)?;
        rx.await.map_err(|_| HandlerErrorKind::Disconnected)
    }

    /// Writes `pkg` directly, bypassing the queue (§4.2 `dispatch`, direct).
    /// Used by the handshake, which runs before the loops start (or while
    /// they're paused during Panic recovery).
    pub async fn dispatch(&self, pkg: &Package) -> Result<(), HandlerErrorKind> {
        let mut writer = self.writer.lock().await;
        write_package(&mut *writer, pkg)
            .await
            .map_err(|_| HandlerErrorKind::CannotWrite)
    }

    /// Reads one package directly, bypassing the queue (§4.2 `obtain`,
    /// direct; any type accepted).
    pub async fn obtain(&self) -> Result<Package, HandlerErrorKind> {
        self.obtain_expected_any(&[]).await
    }

    /// Reads one package directly, requiring a single expected type (§4.1
    /// `obtain_expected`, single variant).
    pub async fn obtain_expected_one(
        &self,
        expected: Option<PackageType>,
    ) -> Result<Package, HandlerErrorKind> {
        let mut reader = self.reader.lock().await;
        read_package_expect_one(
            &mut *reader,
            self.receive_timeout,
            &self.cancel,
            self.max_payload,
            expected,
        )
        .await
        .map_err(|e| classify_codec_error(&e))
    }

    /// Reads one package directly, requiring one of a set of expected types
    /// (§4.1 `obtain_expected`, set variant; an empty set accepts any type).
    pub async fn obtain_expected_any(
        &self,
        expected: &[PackageType],
    ) -> Result<Package, HandlerErrorKind> {
        let mut reader = self.reader.lock().await;
        read_package_expect_any(
            &mut *reader,
            self.receive_timeout,
            &self.cancel,
            self.max_payload,
            expected,
        )
        .await
        .map_err(|e| classify_codec_error(&e))
    }

    /// Spawns the obtain and dispatch loops (§4.2 `start_all`). Idempotent
    /// only in the sense that calling it twice spawns a second, redundant
    /// pair of loops — callers are expected to call it exactly once, after
    /// a successful join.
    pub async fn start_all(self: &Arc<Self>) {
        let rx = self
            .queue_rx
            .lock()
            .await
            .take()
            .expect("start_all called more than once");

        let obtain_task = tokio::spawn(Self::run_obtain_loop(
            self.reader.clone(),
            self.obtain_gate.clone(),
            self.cancel.clone(),
            self.callbacks.clone(),
            self.receive_timeout,
            self.max_payload,
        ));

        let dispatch_task = tokio::spawn(Self::run_dispatch_loop(
            self.writer.clone(),
            self.dispatch_gate.clone(),
            self.cancel.clone(),
            self.callbacks.clone(),
            rx,
            self.drain_on_stop.clone(),
            self.pause_mutex.clone(),
        ));

        let mut tasks = self.tasks.lock().await;
        tasks.push(obtain_task);
        tasks.push(dispatch_task);
    }

    async fn run_obtain_loop(
        reader: Arc<AsyncMutex<R>>,
        gate: Arc<Gate>,
        cancel: CancellationToken,
        callbacks: Arc<Cb>,
        timeout: Duration,
        max_payload: usize,
    ) {
        loop {
            gate.wait(&cancel).await;
            if cancel.is_cancelled() {
                return;
            }

            let read_result = {
                let mut reader = reader.lock().await;
                read_package_expect_any(&mut *reader, timeout, &cancel, max_payload, &[]).await
            };

            match read_result {
                Ok(pkg) => {
                    if pkg.package_type.is_internal() {
                        callbacks.on_internal(pkg).await;
                    } else {
                        debug!(?pkg.data_type, "data package received");
                        callbacks.on_data(pkg);
                    }
                }
                Err(err) => {
                    if cancel.is_cancelled() {
                        return;
                    }
                    let kind = classify_codec_error(&err);
                    warn!(?kind, "obtain loop framing error");
                    callbacks.on_error(kind).await;
                    if kind.is_terminal() {
                        return;
                    }
                }
            }
        }
    }

    async fn run_dispatch_loop(
        writer: Arc<AsyncMutex<W>>,
        gate: Arc<Gate>,
        cancel: CancellationToken,
        callbacks: Arc<Cb>,
        mut rx: mpsc::UnboundedReceiver<Package>,
        drain_on_stop: Arc<AtomicBool>,
        pause_mutex: Arc<AsyncMutex<()>>,
    ) {
        loop {
            gate.wait(&cancel).await;

            // Checked explicitly (rather than left to race against `rx.recv()`
            // inside the `select!` below) so that a `stop_all`/
            // `stop_and_dispatch_rest` caller that cancels and reopens the
            // gate in the same breath deterministically lands here instead of
            // `select!` picking the `rx.recv()` branch when items are already
            // queued — the drain-then-abort contract only holds if this path
            // is the one that runs.
            if cancel.is_cancelled() {
                if drain_on_stop.load(Ordering::Acquire) {
                    let mut writer = writer.lock().await;
                    while let Ok(mut pkg) = rx.try_recv() {
                        if write_package(&mut *writer, &pkg).await.is_err() {
                            break;
                        }
                        if let Some(tx) = pkg.completion.take() {
                            let _ = tx.send(());
                        }
                    }
                }
                return;
            }

            tokio::select! {
                _ = cancel.cancelled() => {
                    if drain_on_stop.load(Ordering::Acquire) {
                        let mut writer = writer.lock().await;
                        while let Ok(mut pkg) = rx.try_recv() {
                            if write_package(&mut *writer, &pkg).await.is_err() {
                                break;
                            }
                            if let Some(tx) = pkg.completion.take() {
                                let _ = tx.send(());
                            }
                        }
                    }
                    return;
                }
                maybe_pkg = rx.recv() => {
                    match maybe_pkg {
                        Some(mut pkg) => {
                            // Re-check the gate under the same permit
                            // `pause_all`/`resume_all` take, so a pause that
                            // lands between this package leaving the queue
                            // and the write below is guaranteed to either
                            // win the race (we see it closed and park) or
                            // lose it cleanly (we finish the write, release
                            // the permit, and only then does `pause_all`
                            // return) — never both observe the gate open
                            // and have `pause_all` already returned.
                            let result = loop {
                                let permit = pause_mutex.lock().await;
                                if !gate.is_open() {
                                    drop(permit);
                                    gate.wait(&cancel).await;
                                    continue;
                                }
                                let write_result = {
                                    let mut writer = writer.lock().await;
                                    write_package(&mut *writer, &pkg).await
                                };
                                drop(permit);
                                break write_result;
                            };
                            match result {
                                Ok(()) => {
                                    if let Some(tx) = pkg.completion.take() {
                                        let _ = tx.send(());
                                    }
                                }
                                Err(_) => {
                                    warn!("dispatch loop write failure");
                                    callbacks.on_error(HandlerErrorKind::CannotWrite).await;
                                }
                            }
                        }
                        None => return,
                    }
                }
            }
        }
    }

    /// Pauses both loops (§4.2 `pause_all`, §9 manual-reset gate + 1-permit
    /// mutex). The permit mutex serializes concurrent pause/resume callers
    /// *and* is taken by the dispatch loop around its write, so this only
    /// returns once any write already in flight has completed and the gate
    /// is closed for whoever queues next (§9 "no further read/write occurs
    /// until resume").
    pub async fn pause_all(&self) {
        let _permit = self.pause_mutex.lock().await;
        self.obtain_gate.close_gate();
        self.dispatch_gate.close_gate();
    }

    /// Resumes both loops (§4.2 `resume_all`).
    pub async fn resume_all(&self) {
        let _permit = self.pause_mutex.lock().await;
        self.obtain_gate.open_gate();
        self.dispatch_gate.open_gate();
    }

    /// Cancels both loops and awaits their tasks; queued-but-undispatched
    /// packages are dropped along with the channel (§5 "only `close` drops
    /// them" — in practice `stop_all` alone already orphans them, since
    /// nothing drains the queue further).
    ///
    /// Terminal `on_error`/`on_internal` handling (§7) routinely calls this
    /// from *inside* the obtain or dispatch loop's own task — joining that
    /// task's `JoinHandle` from within itself would wait forever, since the
    /// task can't finish a call it's still suspended inside. This skips
    /// awaiting whichever handle (if any) belongs to the task currently
    /// running `stop_all`; that task simply returns to its loop, observes
    /// cancellation, and finishes on its own right after this call returns.
    /// Any other, genuinely external task is still joined as before.
    pub async fn stop_all(&self) {
        self.cancel.cancel();
        self.obtain_gate.open_gate();
        self.dispatch_gate.open_gate();
        let current = tokio::task::try_id();
        let mut tasks = self.tasks.lock().await;
        for task in tasks.drain(..) {
            if current == Some(task.id()) {
                continue;
            }
            let _ = task.await;
        }
    }

    /// Like [`Self::stop_all`], but the dispatch loop first drains every
    /// package already queued, writing each in turn and aborting at the
    /// first write failure (§4.2 `stop_and_dispatch_rest`).
    pub async fn stop_and_dispatch_rest(&self) {
        self.drain_on_stop.store(true, Ordering::Release);
        self.stop_all().await;
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{DataType, HEADER_SIZE};
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex as StdMutex;
    use tokio::io::duplex;

    struct RecordingCallbacks {
        internal_count: AtomicUsize,
        data_count: AtomicUsize,
        errors: StdMutex<Vec<HandlerErrorKind>>,
    }

    impl RecordingCallbacks {
        fn new() -> Self {
            Self {
                internal_count: AtomicUsize::new(0),
                data_count: AtomicUsize::new(0),
                errors: StdMutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl PackageCallbacks for RecordingCallbacks {
        async fn on_internal(&self, _pkg: Package) {
            self.internal_count.fetch_add(1, Ordering::SeqCst);
        }

        fn on_data(&self, _pkg: Package) {
            self.data_count.fetch_add(1, Ordering::SeqCst);
        }

        async fn on_error(&self, kind: HandlerErrorKind) {
            self.errors.lock().unwrap().push(kind);
        }
    }

    #[tokio::test]
    async fn send_await_completes_after_write() {
        let (client, mut server) = duplex(4096);
        let (read_half, write_half) = tokio::io::split(client);
        let callbacks = Arc::new(RecordingCallbacks::new());
        let handler = Arc::new(PackageHandler::new(
            read_half,
            write_half,
            callbacks,
            Duration::from_millis(200),
            crate::codec::DEFAULT_MAX_PAYLOAD,
        ));
        handler.start_all().await;

        let pkg = Package::new(PackageType::Ping, DataType::Empty, None);
        handler.send_await(pkg).await.unwrap();

        let mut buf = [0u8; 6];
        server.read_exact(&mut buf).await.unwrap();
        assert_eq!(buf[0], PackageType::Ping as u8);

        handler.stop_all().await;
    }

    #[tokio::test]
    async fn pause_blocks_obtain_until_resumed() {
        let (client, mut server) = duplex(4096);
        let (read_half, write_half) = tokio::io::split(client);
        let callbacks = Arc::new(RecordingCallbacks::new());
        let handler = Arc::new(PackageHandler::new(
            read_half,
            write_half,
            callbacks.clone(),
            Duration::from_millis(200),
            crate::codec::DEFAULT_MAX_PAYLOAD,
        ));
        handler.pause_all().await;
        handler.start_all().await;

        let pkg = Package::empty(PackageType::Ping);
        server.write_all(&pkg.to_bytes()).await.unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(callbacks.internal_count.load(Ordering::SeqCst), 0);

        handler.resume_all().await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(callbacks.internal_count.load(Ordering::SeqCst), 1);

        handler.stop_all().await;
    }

    #[tokio::test]
    async fn pause_all_waits_for_an_already_queued_write_to_finish() {
        let (client, mut server) = duplex(4096);
        let (read_half, write_half) = tokio::io::split(client);
        let callbacks = Arc::new(RecordingCallbacks::new());
        let handler = Arc::new(PackageHandler::new(
            read_half,
            write_half,
            callbacks,
            Duration::from_millis(200),
            crate::codec::DEFAULT_MAX_PAYLOAD,
        ));
        handler.start_all().await;

        // Queue a package and give the dispatch loop a moment to pull it off
        // the channel and park on `rx.recv()`'s next iteration, then race
        // `pause_all` against it. If `pause_all` could return before the
        // queued write actually lands, a byte written "during" the paused
        // window would show up on the wire after this call returns.
        handler.send(Package::empty(PackageType::Ping)).unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        handler.pause_all().await;

        let mut buf = [0u8; 6];
        let read = tokio::time::timeout(Duration::from_millis(100), server.read_exact(&mut buf)).await;
        assert!(
            read.is_ok(),
            "pause_all returned but the already-queued write never completed"
        );
        assert_eq!(buf[0], PackageType::Ping as u8);

        // Nothing sent after pause_all returns should reach the wire until
        // resume_all is called.
        handler.send(Package::empty(PackageType::Pong)).unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        let mut probe = [0u8; 1];
        assert!(
            tokio::time::timeout(Duration::from_millis(10), server.read_exact(&mut probe))
                .await
                .is_err(),
            "dispatch loop wrote a package while paused"
        );

        handler.resume_all().await;
        server.read_exact(&mut buf).await.unwrap();
        assert_eq!(buf[0], PackageType::Pong as u8);

        handler.stop_all().await;
    }

    #[tokio::test]
    async fn stop_and_dispatch_rest_drains_queued_packages_before_stopping() {
        let (client, mut server) = duplex(4096);
        let (read_half, write_half) = tokio::io::split(client);
        let callbacks = Arc::new(RecordingCallbacks::new());
        let handler = Arc::new(PackageHandler::new(
            read_half,
            write_half,
            callbacks,
            Duration::from_millis(200),
            crate::codec::DEFAULT_MAX_PAYLOAD,
        ));

        // Pause before starting so both loop tasks park on the gate rather
        // than racing the sends below; everything queued here sits
        // untouched until `stop_and_dispatch_rest` cancels and reopens it.
        handler.pause_all().await;
        handler.start_all().await;

        let (tx1, rx1) = oneshot::channel();
        let (tx2, rx2) = oneshot::channel();
        handler
            .send(Package::empty(PackageType::Ping).with_completion(tx1))
            .unwrap();
        handler
            .send(Package::empty(PackageType::Pong).with_completion(tx2))
            .unwrap();

        handler.stop_and_dispatch_rest().await;

        rx1.await.unwrap();
        rx2.await.unwrap();

        let mut buf = [0u8; HEADER_SIZE * 2];
        server.read_exact(&mut buf).await.unwrap();
        assert_eq!(buf[0], PackageType::Ping as u8);
        assert_eq!(buf[HEADER_SIZE], PackageType::Pong as u8);
    }

    #[tokio::test]
    async fn stop_and_dispatch_rest_aborts_at_first_write_failure() {
        let (client, server) = duplex(4096);
        let (read_half, write_half) = tokio::io::split(client);
        let callbacks = Arc::new(RecordingCallbacks::new());
        let handler = Arc::new(PackageHandler::new(
            read_half,
            write_half,
            callbacks,
            Duration::from_millis(200),
            crate::codec::DEFAULT_MAX_PAYLOAD,
        ));

        handler.pause_all().await;
        handler.start_all().await;

        let (tx1, rx1) = oneshot::channel();
        let (tx2, rx2) = oneshot::channel();
        handler
            .send(Package::empty(PackageType::Ping).with_completion(tx1))
            .unwrap();
        handler
            .send(Package::empty(PackageType::Pong).with_completion(tx2))
            .unwrap();

        // Drop the peer so the drain's writes fail outright instead of
        // landing in the duplex buffer.
        drop(server);

        handler.stop_and_dispatch_rest().await;

        // The drain aborts at the first write failure (§4.2); a package
        // whose write never happens never gets its completion signaled.
        assert!(rx1.try_recv().is_err());
        assert!(rx2.try_recv().is_err());
    }

    type DuplexHandler<Cb> =
        PackageHandler<tokio::io::ReadHalf<tokio::io::DuplexStream>, tokio::io::WriteHalf<tokio::io::DuplexStream>, Cb>;

    struct SelfStoppingCallbacks {
        handler: std::sync::OnceLock<std::sync::Weak<DuplexHandler<SelfStoppingCallbacks>>>,
        stopped: Notify,
    }

    impl SelfStoppingCallbacks {
        fn new() -> Self {
            Self {
                handler: std::sync::OnceLock::new(),
                stopped: Notify::new(),
            }
        }

        fn bind(&self, handler: std::sync::Weak<DuplexHandler<SelfStoppingCallbacks>>) {
            let _ = self.handler.set(handler);
        }
    }

    #[async_trait]
    impl PackageCallbacks for SelfStoppingCallbacks {
        async fn on_internal(&self, _pkg: Package) {}
        fn on_data(&self, _pkg: Package) {}

        // Mirrors the real terminal-error teardown path (client/server
        // `on_error`): call `stop_all` from inside the very loop task that
        // `on_error` itself runs on.
        async fn on_error(&self, _kind: HandlerErrorKind) {
            if let Some(handler) = self.handler.get().and_then(|h| h.upgrade()) {
                handler.stop_all().await;
            }
            self.stopped.notify_one();
        }
    }

    #[tokio::test]
    async fn stop_all_called_from_its_own_loop_task_does_not_deadlock() {
        let (client, server) = duplex(64);
        let (read_half, write_half) = tokio::io::split(client);
        let callbacks = Arc::new(SelfStoppingCallbacks::new());
        let handler = Arc::new(PackageHandler::new(
            read_half,
            write_half,
            callbacks.clone(),
            Duration::from_millis(200),
            crate::codec::DEFAULT_MAX_PAYLOAD,
        ));
        callbacks.bind(Arc::downgrade(&handler));
        handler.start_all().await;

        // Drop the peer without writing anything: the obtain loop's very
        // first read hits a clean EOF, classified as a terminal
        // `Disconnected`, and `on_error` reacts by calling `stop_all` on the
        // handler it's currently running inside of.
        drop(server);

        let result = tokio::time::timeout(Duration::from_secs(2), callbacks.stopped.notified()).await;
        assert!(
            result.is_ok(),
            "on_error's stop_all() call, made from within the obtain loop's own task, hung"
        );
    }
}
