//! The C-STORE SCU orchestrator.
use std::any::Any;
use std::collections::{BTreeMap, VecDeque};
use std::io::{Read, Write};
use std::net::TcpStream;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use courier_ul::association::{Association, SessionSocket};
use courier_ul::pdu::{Pdu, PresentationContextNegotiated, PresentationContextResultReason};
use courier_ul::{ClientAssociation, ClientAssociationOptions};
use dicom_dictionary_std::uids;
use dicom_encoding::transfer_syntax::TransferSyntaxIndex;
use dicom_object::DefaultDicomObject;
use dicom_transfer_syntax_registry::TransferSyntaxRegistry;
use snafu::{ensure_whatever, whatever, OptionExt, ResultExt};
use tracing::{debug, info, warn};

use crate::codec::{PixelDataCodec, RegistryCodec};
use crate::command::{status_class, CommandField, CommandSet, Priority, StatusClass};
use crate::dimse::{
    send_dimse, AssemblerOptions, DimseAssembler, DimseMonitor, PayloadSource,
};
use crate::{Error, NoAcceptedContextSnafu, Result, ServiceStatusSnafu};

use super::queue::{PreloadBatch, Preloader};
use super::request::{self, CStoreRequest, LoadPolicy, RequestHandle, RequestStatus};
use super::{StoreClientOptions, StoreObserver};

/// The sleep between queue checks while lingering.
const QUEUE_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// A handle for requesting cancellation of a running store session
/// from another thread (or from an observer callback).
#[derive(Debug, Clone)]
pub struct CancelHandle {
    flag: Arc<AtomicBool>,
}

impl CancelHandle {
    /// Raise the cancellation flag.
    ///
    /// The session observes the flag between requests
    /// and between outbound data fragments.
    pub fn cancel(&self) {
        self.flag.store(true, Ordering::Relaxed);
    }

    /// Whether cancellation was requested.
    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::Relaxed)
    }
}

/// A C-STORE service class user.
///
/// Files are queued with [`add_file`](Self::add_file);
/// [`send_to`](Self::send_to) then drives the whole transfer
/// on a background session thread:
/// it proposes presentation contexts derived from the queued files,
/// sends one C-STORE request at a time awaiting each response,
/// lingers for the configured duration once the queue drains,
/// and releases the association.
///
/// A transport failure resets the in-flight request,
/// returns it to the head of the queue,
/// and reconnects, unless cancellation was requested.
/// Requests queued under a SOP class that the running association
/// never negotiated trigger a reassociation with a fresh proposal set.
///
/// # Example
///
/// ```no_run
/// # use courier_store::store::{StoreClient, StoreClientOptions};
/// # fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let mut client = StoreClient::new(StoreClientOptions {
///     calling_ae_title: "COURIER-SCU".into(),
///     ..Default::default()
/// });
/// client.add_file("ct-slice-001.dcm");
/// client.add_file("ct-slice-002.dcm");
/// client.send_to("STORE-SCP@pacs.hospital.example.com:104")?;
/// client.wait()?;
/// # Ok(())
/// # }
/// ```
pub struct StoreClient {
    options: Arc<StoreClientOptions>,
    codec: Arc<dyn PixelDataCodec>,
    observer: Arc<dyn StoreObserver>,
    queue: Arc<Mutex<VecDeque<RequestHandle>>>,
    /// observed (SOP class, transfer syntax) pairs of the queued files
    contexts_map: Arc<Mutex<BTreeMap<String, Vec<String>>>>,
    cancel: Arc<AtomicBool>,
    /// raised together with `cancel` for a forced, non-graceful stop
    force: Arc<AtomicBool>,
    preloader: Option<Preloader>,
    session: Option<JoinHandle<Result<()>>>,
}

impl StoreClient {
    /// Create a new store client with the given options.
    pub fn new(options: StoreClientOptions) -> Self {
        StoreClient {
            options: Arc::new(options),
            codec: Arc::new(RegistryCodec),
            observer: Arc::new(()),
            queue: Arc::new(Mutex::new(VecDeque::new())),
            contexts_map: Arc::new(Mutex::new(BTreeMap::new())),
            cancel: Arc::new(AtomicBool::new(false)),
            force: Arc::new(AtomicBool::new(false)),
            preloader: None,
            session: None,
        }
    }

    /// Install an observer of the session lifecycle.
    ///
    /// Must be called before the session starts.
    pub fn with_observer(mut self, observer: impl StoreObserver + 'static) -> Self {
        self.observer = Arc::new(observer);
        self
    }

    /// Replace the pixel data codec collaborator.
    ///
    /// Must be called before the session starts.
    pub fn with_codec(mut self, codec: impl PixelDataCodec + 'static) -> Self {
        self.codec = Arc::new(codec);
        self
    }

    /// Parse the file meta information of a DICOM file
    /// and queue it for storage.
    ///
    /// The (SOP class, transfer syntax) pair observed in the file
    /// feeds the presentation contexts proposed at the next connect.
    /// A file that fails to parse is not queued;
    /// the returned handle carries
    /// [`ProcessingFailure`](RequestStatus::ProcessingFailure)
    /// and the parse error.
    pub fn add_file(&self, path: impl AsRef<Path>) -> RequestHandle {
        self.add_file_impl(path.as_ref(), None, None)
    }

    /// Queue a DICOM file with a piece of application data attached.
    pub fn add_file_with_state(
        &self,
        path: impl AsRef<Path>,
        user_state: Box<dyn Any + Send>,
    ) -> RequestHandle {
        self.add_file_impl(path.as_ref(), Some(user_state), None)
    }

    /// Queue a DICOM file,
    /// deriving application data from its parsed attributes.
    ///
    /// The data set is parsed up to (but excluding) the pixel data
    /// and handed to `extract`.
    pub fn add_file_with_fields(
        &self,
        path: impl AsRef<Path>,
        extract: &dyn Fn(&DefaultDicomObject) -> Option<Box<dyn Any + Send>>,
    ) -> RequestHandle {
        self.add_file_impl(path.as_ref(), None, Some(extract))
    }

    fn add_file_impl(
        &self,
        path: &Path,
        user_state: Option<Box<dyn Any + Send>>,
        extractor: Option<&dyn Fn(&DefaultDicomObject) -> Option<Box<dyn Any + Send>>>,
    ) -> RequestHandle {
        match request::parse_file(path, extractor) {
            Ok(mut req) => {
                if req.user_state.is_none() {
                    req.user_state = user_state;
                }
                {
                    let mut map = lock(&self.contexts_map);
                    let entry = map.entry(req.sop_class_uid.clone()).or_default();
                    if !entry.iter().any(|ts| ts == &req.original_transfer_syntax) {
                        entry.push(req.original_transfer_syntax.clone());
                    }
                }
                let handle = Arc::new(Mutex::new(req));
                lock(&self.queue).push_back(Arc::clone(&handle));
                handle
            }
            Err(e) => {
                warn!("could not queue {}: {}", path.display(), e);
                Arc::new(Mutex::new(CStoreRequest::failed(
                    path.to_path_buf(),
                    &e,
                    user_state,
                )))
            }
        }
    }

    /// The number of requests waiting in the queue.
    pub fn queued(&self) -> usize {
        lock(&self.queue).len()
    }

    /// Obtain a handle for cancelling the session
    /// from another thread or from an observer callback.
    pub fn cancel_handle(&self) -> CancelHandle {
        CancelHandle {
            flag: Arc::clone(&self.cancel),
        }
    }

    /// Open a transport to the given address
    /// (`host:port`, optionally with the AE title as `AE@host:port`)
    /// and start sending the queued requests
    /// on a background session thread.
    pub fn send_to(&mut self, address: &str) -> Result<()> {
        ensure_whatever!(
            self.session.is_none(),
            "a store session is already running; call wait() first"
        );
        self.cancel.store(false, Ordering::Relaxed);
        self.force.store(false, Ordering::Relaxed);
        let preloader = self.preloader.get_or_insert_with(|| {
            Preloader::new(Arc::clone(&self.options), Arc::clone(&self.codec))
        });
        let ctx = SessionContext {
            options: Arc::clone(&self.options),
            codec: Arc::clone(&self.codec),
            observer: Arc::clone(&self.observer),
            queue: Arc::clone(&self.queue),
            contexts_map: Arc::clone(&self.contexts_map),
            cancel: Arc::clone(&self.cancel),
            force: Arc::clone(&self.force),
            preload_tx: preloader.sender(),
        };
        let address = address.to_string();
        self.session = Some(
            std::thread::Builder::new()
                .name("courier-store".to_string())
                .spawn(move || run_session(ctx, address))
                .whatever_context("could not spawn the session thread")?,
        );
        Ok(())
    }

    /// Re-open a transport after a normal close,
    /// preserving whatever is still in the queue.
    pub fn reconnect(&mut self, address: &str) -> Result<()> {
        // collect the previous session first; its outcome was
        // already reported through the observer
        let _ = self.wait();
        self.send_to(address)
    }

    /// Wait for the session to finish
    /// and collect its outcome.
    pub fn wait(&mut self) -> Result<()> {
        match self.session.take() {
            None => Ok(()),
            Some(session) => match session.join() {
                Ok(outcome) => outcome,
                Err(_) => whatever!("store session thread panicked"),
            },
        }
    }

    /// Request cancellation of the running session.
    ///
    /// With `wait`, the call blocks until the session winds down,
    /// letting the exchange in flight complete
    /// and releasing the association gracefully.
    /// Without it, the session is forced down:
    /// an outbound data set stops at the next fragment boundary,
    /// a pending receive gives up at the next poll,
    /// and the association is aborted rather than released.
    pub fn cancel(&mut self, wait: bool) {
        self.cancel.store(true, Ordering::Relaxed);
        if wait {
            let _ = self.wait();
        } else {
            self.force.store(true, Ordering::Relaxed);
        }
    }

    /// Verify connectivity with a C-ECHO exchange:
    /// associate, send a C-ECHO request, await the response,
    /// and release.
    ///
    /// Runs on the calling thread.
    /// Returns the status code of the C-ECHO response.
    pub fn verify(&self, address: &str) -> Result<u16> {
        let proposals = vec![(
            uids::VERIFICATION.to_string(),
            vec![
                uids::IMPLICIT_VR_LITTLE_ENDIAN.to_string(),
                uids::EXPLICIT_VR_LITTLE_ENDIAN.to_string(),
            ],
        )];
        let mut assoc = association_options(&self.options, proposals)
            .establish_with(address)
            .map_err(Error::from_association)?;

        let pc_id = assoc
            .presentation_contexts()
            .iter()
            .find(|pc| {
                pc.reason == PresentationContextResultReason::Acceptance
                    && pc.abstract_syntax == uids::VERIFICATION
            })
            .map(|pc| pc.id)
            .context(NoAcceptedContextSnafu {
                sop_class_uid: uids::VERIFICATION,
            })?;

        send_dimse(
            &mut assoc,
            pc_id,
            &CommandSet::c_echo_rq(1),
            None,
            &(),
            None,
        )?;

        let mut assembler = DimseAssembler::new(AssemblerOptions::default());
        let response =
            match await_response(&mut assoc, &mut assembler, pc_id, CommandField::CEchoRsp, None) {
            Ok(response) => response,
            Err(e @ Error::UnexpectedDimse { .. }) => {
                let _ = assoc.abort();
                return Err(e);
            }
            Err(e) => return Err(e),
        };
        let status = response.status.unwrap_or(0);

        if let Err(e) = assoc.release() {
            warn!("verification release failed: {}", e);
        }
        if status_class(status) == StatusClass::Failure {
            return ServiceStatusSnafu { status }.fail();
        }
        Ok(status)
    }
}

impl Drop for StoreClient {
    fn drop(&mut self) {
        if self.session.is_some() {
            self.cancel.store(true, Ordering::Relaxed);
            self.force.store(true, Ordering::Relaxed);
            let _ = self.wait();
        }
    }
}

/// Everything the session thread needs.
struct SessionContext {
    options: Arc<StoreClientOptions>,
    codec: Arc<dyn PixelDataCodec>,
    observer: Arc<dyn StoreObserver>,
    queue: Arc<Mutex<VecDeque<RequestHandle>>>,
    contexts_map: Arc<Mutex<BTreeMap<String, Vec<String>>>>,
    cancel: Arc<AtomicBool>,
    force: Arc<AtomicBool>,
    preload_tx: mpsc::Sender<PreloadBatch>,
}

/// How one association ended.
enum AssocOutcome {
    /// The queue drained and the linger window expired
    Drained,
    /// Cancellation was requested
    Canceled,
    /// A fresh proposal set is needed for a newly queued SOP class
    Reassociate,
    /// The association was lost;
    /// `made_progress` tells whether any response arrived on it
    TransportLost { error: Error, made_progress: bool },
}

fn run_session(ctx: SessionContext, address: String) -> Result<()> {
    let mut failures_without_progress = 0u32;
    loop {
        if ctx.cancel.load(Ordering::Relaxed) {
            break;
        }
        if lock(&ctx.queue).is_empty() {
            break;
        }

        let proposals = build_proposals(&ctx);
        let proposed_classes: Vec<String> = {
            let map = lock(&ctx.contexts_map);
            map.keys().cloned().collect()
        };
        let assoc = match association_options(&ctx.options, proposals).establish_with(&address) {
            Ok(assoc) => assoc,
            Err(e) => {
                let error = Error::from_association(e);
                ctx.observer.on_network_error(&error);
                ctx.observer.on_closed(true);
                return Err(error);
            }
        };
        info!(
            "association established with {} ({} presentation contexts)",
            assoc.peer_ae_title(),
            assoc.presentation_contexts().len()
        );

        match run_association(&ctx, assoc, &proposed_classes) {
            AssocOutcome::Drained => {
                ctx.observer.on_closed(false);
                failures_without_progress = 0;
                // files may have been queued while releasing
                continue;
            }
            AssocOutcome::Reassociate => {
                debug!("reassociating with a fresh proposal set");
                ctx.observer.on_closed(false);
                failures_without_progress = 0;
                continue;
            }
            AssocOutcome::Canceled => {
                ctx.observer.on_closed(false);
                break;
            }
            AssocOutcome::TransportLost {
                error,
                made_progress,
            } => {
                ctx.observer.on_network_error(&error);
                ctx.observer.on_closed(true);
                if made_progress {
                    failures_without_progress = 0;
                }
                failures_without_progress += 1;
                if ctx.cancel.load(Ordering::Relaxed) {
                    break;
                }
                if failures_without_progress > 1 {
                    return Err(error);
                }
                debug!("reconnecting to {}", address);
                continue;
            }
        }
    }

    let drained = lock(&ctx.queue).is_empty();
    if drained && !ctx.cancel.load(Ordering::Relaxed) {
        ctx.observer.on_complete();
    }
    Ok(())
}

/// Drive one established association until the queue drains,
/// cancellation, or loss of transport.
fn run_association(
    ctx: &SessionContext,
    mut assoc: ClientAssociation<TcpStream>,
    proposed_classes: &[String],
) -> AssocOutcome {
    let options = &ctx.options;
    let contexts: Arc<Vec<PresentationContextNegotiated>> =
        Arc::new(assoc.presentation_contexts().to_vec());
    let policy = LoadPolicy {
        disable_file_streaming: options.disable_file_streaming,
        preferred_transfer_syntax: options.preferred_transfer_syntax.as_deref(),
        preferred_transfer_syntax_params: options.preferred_transfer_syntax_params.as_ref(),
        codec: ctx.codec.as_ref(),
    };
    let mut assembler = DimseAssembler::new(AssemblerOptions {
        use_file_buffer: options.use_file_buffer,
        spill_directory: None,
    });
    let mut message_id: u16 = 1;
    let mut made_progress = false;
    let linger = options.linger + Duration::from_secs(1);
    let mut linger_deadline = Instant::now() + linger;

    loop {
        while let Some(handle) = lock(&ctx.queue).pop_front() {
            if ctx.cancel.load(Ordering::Relaxed) {
                lock(&ctx.queue).push_front(handle);
                return finish_release(assoc, AssocOutcome::Canceled);
            }
            // keep the look-ahead loaded
            kick_preloader(ctx, &contexts);

            let mut req = handle.lock().unwrap_or_else(|e| e.into_inner());

            if let Err(e) = request::load(&mut req, &contexts, &policy) {
                if matches!(e, Error::NoAcceptedContext { .. })
                    && !proposed_classes.contains(&req.sop_class_uid)
                {
                    // the SOP class was queued after this association
                    // was proposed; renegotiate with a fresh proposal set
                    drop(req);
                    lock(&ctx.queue).push_front(handle);
                    return finish_release(assoc, AssocOutcome::Reassociate);
                }
                req.status = if matches!(e, Error::NoAcceptedContext { .. }) {
                    RequestStatus::SopClassNotSupported
                } else {
                    RequestStatus::ProcessingFailure
                };
                req.last_error = Some(e.to_string());
                ctx.observer.on_request_failed(&req);
                continue;
            }

            ctx.observer.on_request_begin(&req);

            // the accepted context for (SOP class, effective transfer syntax)
            let pc_id = contexts
                .iter()
                .find(|pc| {
                    pc.reason == PresentationContextResultReason::Acceptance
                        && pc.abstract_syntax == req.sop_class_uid
                        && pc.transfer_syntax == req.effective_transfer_syntax
                })
                .map(|pc| pc.id);
            let pc_id = match pc_id {
                Some(id) => id,
                None => {
                    req.status = RequestStatus::SopClassNotSupported;
                    request::unload(&mut req);
                    ctx.observer.on_request_failed(&req);
                    continue;
                }
            };

            let command = CommandSet::c_store_rq(
                message_id,
                &req.sop_class_uid,
                &req.sop_instance_uid,
                Priority::Medium,
            );
            debug!(
                "sending {} ({}) under context {}",
                req.sop_instance_uid, req.effective_transfer_syntax, pc_id
            );
            // serialize up front, so that a local encoding failure
            // costs only this request and not the association
            let payload_bytes = if req.stream_from_file {
                None
            } else {
                match encode_dataset(&req) {
                    Ok(bytes) => Some(bytes),
                    Err(e) => {
                        req.status = RequestStatus::ProcessingFailure;
                        req.last_error = Some(e.to_string());
                        request::unload(&mut req);
                        ctx.observer.on_request_failed(&req);
                        continue;
                    }
                }
            };

            let monitor = RequestProgress {
                observer: ctx.observer.as_ref(),
                request: &req,
            };
            let send_result = match &payload_bytes {
                None => send_dimse(
                    &mut assoc,
                    pc_id,
                    &command,
                    Some(PayloadSource::File(&req.file_name)),
                    &monitor,
                    Some(&ctx.force),
                ),
                Some(bytes) => send_dimse(
                    &mut assoc,
                    pc_id,
                    &command,
                    Some(PayloadSource::Bytes(bytes)),
                    &monitor,
                    Some(&ctx.force),
                ),
            };

            match send_result {
                Ok(_) => {}
                Err(Error::Cancelled) => {
                    // forced close: the peer holds an incomplete message
                    request::reset(&mut req);
                    drop(req);
                    lock(&ctx.queue).push_front(handle);
                    let _ = assoc.abort();
                    return AssocOutcome::Canceled;
                }
                Err(e) if e.ends_association() => {
                    request::reset(&mut req);
                    drop(req);
                    lock(&ctx.queue).push_front(handle);
                    // the association already went down with the error
                    return AssocOutcome::TransportLost {
                        error: e,
                        made_progress,
                    };
                }
                Err(e) => {
                    // a local failure; the exchange may be half-sent,
                    // so the association cannot be trusted anymore
                    req.status = RequestStatus::ProcessingFailure;
                    req.last_error = Some(e.to_string());
                    ctx.observer.on_request_failed(&req);
                    drop(req);
                    let _ = assoc.abort();
                    return AssocOutcome::TransportLost {
                        error: e,
                        made_progress,
                    };
                }
            }

            match await_response(
                &mut assoc,
                &mut assembler,
                pc_id,
                CommandField::CStoreRsp,
                Some(&ctx.force),
            ) {
                Ok(response) => {
                    // treat a response with no status as a failure
                    let status = response.status.unwrap_or(0x0110);
                    req.status = match status_class(status) {
                        StatusClass::Success => RequestStatus::Success,
                        StatusClass::Warning => RequestStatus::Warning(status),
                        _ => RequestStatus::Failure(status),
                    };
                    made_progress = true;
                    ctx.observer.on_response(&req, status);
                    match req.status {
                        RequestStatus::Success | RequestStatus::Warning(_) => {
                            ctx.observer.on_request_complete(&req)
                        }
                        _ => ctx.observer.on_request_failed(&req),
                    }
                    request::unload(&mut req);
                    message_id = message_id.wrapping_add(1);
                    linger_deadline = Instant::now() + linger;
                }
                Err(Error::Cancelled) => {
                    // the receive was interrupted by a forced cancel;
                    // the association was already aborted
                    request::reset(&mut req);
                    drop(req);
                    lock(&ctx.queue).push_front(handle);
                    return AssocOutcome::Canceled;
                }
                Err(e @ Error::UnexpectedDimse { .. }) => {
                    request::reset(&mut req);
                    drop(req);
                    lock(&ctx.queue).push_front(handle);
                    let _ = assoc.abort();
                    return AssocOutcome::TransportLost {
                        error: e,
                        made_progress,
                    };
                }
                Err(e) => {
                    request::reset(&mut req);
                    drop(req);
                    lock(&ctx.queue).push_front(handle);
                    return AssocOutcome::TransportLost {
                        error: e,
                        made_progress,
                    };
                }
            }
        }

        if ctx.cancel.load(Ordering::Relaxed) {
            return finish_release(assoc, AssocOutcome::Canceled);
        }
        if Instant::now() >= linger_deadline {
            return finish_release(assoc, AssocOutcome::Drained);
        }
        std::thread::sleep(QUEUE_POLL_INTERVAL);
    }
}

/// Gracefully release the association before reporting the outcome.
fn finish_release(assoc: ClientAssociation<TcpStream>, outcome: AssocOutcome) -> AssocOutcome {
    if let Err(e) = assoc.release() {
        warn!("association release failed: {}", e);
    }
    outcome
}

/// Receive PDUs until the expected DIMSE response arrives.
///
/// An exchange already in flight is given up
/// as soon as the cancellation flag is raised.
fn await_response<S>(
    assoc: &mut ClientAssociation<S>,
    assembler: &mut DimseAssembler,
    presentation_context_id: u8,
    expected: CommandField,
    cancel: Option<&AtomicBool>,
) -> Result<CommandSet>
where
    S: Read + Write + SessionSocket,
{
    loop {
        let pdu = match assoc.receive_interruptible(cancel) {
            Ok(pdu) => pdu,
            Err(courier_ul::association::Error::Interrupted { .. }) => {
                return Err(Error::Cancelled);
            }
            Err(e) => return Err(Error::from_association(e)),
        };
        match pdu {
            Pdu::PData { data } => {
                for pdv in data {
                    if let Some(message) =
                        assembler.feed(pdv, assoc.presentation_contexts(), &())?
                    {
                        if message.command.field == expected
                            && message.presentation_context_id == presentation_context_id
                        {
                            // responses carry no data set;
                            // drop anything that came along regardless
                            if let Some(dataset) = &message.dataset {
                                dataset.cleanup();
                            }
                            return Ok(message.command);
                        }
                        if let Some(dataset) = &message.dataset {
                            dataset.cleanup();
                        }
                        return Err(Error::UnexpectedDimse {
                            field: message.command.field.code(),
                        });
                    }
                }
            }
            Pdu::ReleaseRQ => {
                // peer-initiated release in the middle of an exchange;
                // answer it and report the association as gone
                let _ = assoc.send(&Pdu::ReleaseRP);
                return Err(Error::from_association(
                    courier_ul::association::ConnectionClosedSnafu.build(),
                ));
            }
            // every other PDU was screened out by `receive`
            pdu => {
                debug!("ignoring {}", pdu.short_description());
            }
        }
    }
}

/// Forward outbound progress to the store observer.
struct RequestProgress<'a> {
    observer: &'a dyn StoreObserver,
    request: &'a CStoreRequest,
}

impl DimseMonitor for RequestProgress<'_> {
    fn on_send_progress(&self, _presentation_context_id: u8, bytes_sent: u64) {
        self.observer.on_request_progress(self.request, bytes_sent);
    }
}

/// Serialize the loaded data set under the effective transfer syntax.
fn encode_dataset(request: &CStoreRequest) -> Result<Vec<u8>> {
    let obj = request
        .dataset
        .as_ref()
        .whatever_context::<_, Error>("request payload is not loaded")?;
    let ts = TransferSyntaxRegistry
        .get(&request.effective_transfer_syntax)
        .with_whatever_context::<_, _, Error>(|| {
            format!(
                "unsupported transfer syntax {}",
                request.effective_transfer_syntax
            )
        })?;
    let mut bytes = Vec::with_capacity(4096);
    obj.write_dataset_with_ts(&mut bytes, ts)
        .whatever_context("could not serialize data set")?;
    Ok(bytes)
}

/// Hand the next `preload_count` unloaded queue entries
/// to the background preloader.
fn kick_preloader(ctx: &SessionContext, contexts: &Arc<Vec<PresentationContextNegotiated>>) {
    let count = ctx.options.preload_count;
    if count == 0 {
        return;
    }
    let handles: Vec<RequestHandle> = {
        let queue = lock(&ctx.queue);
        queue
            .iter()
            .filter(|handle| {
                let request = handle.lock().unwrap_or_else(|e| e.into_inner());
                !request.is_loaded()
            })
            .take(count)
            .cloned()
            .collect()
    };
    if !handles.is_empty() {
        let _ = ctx.preload_tx.send(PreloadBatch {
            handles,
            contexts: Arc::clone(contexts),
        });
    }
}

/// Build the presentation context proposals
/// from the observed (SOP class, transfer syntax) pairs.
///
/// Each SOP class proposes, in order:
/// the preferred transfer syntax (exactly once, first),
/// the syntaxes observed in the queued files,
/// Explicit VR Little Endian when offered,
/// and Implicit VR Little Endian as the universal fallback.
fn build_proposals(ctx: &SessionContext) -> Vec<(String, Vec<String>)> {
    let options = &ctx.options;
    let map = lock(&ctx.contexts_map);
    let mut proposals = Vec::with_capacity(map.len());
    for (sop_class, observed) in map.iter() {
        let mut syntaxes: Vec<String> = Vec::new();
        if let Some(preferred) = &options.preferred_transfer_syntax {
            push_unique(&mut syntaxes, preferred);
        }
        for ts in observed {
            push_unique(&mut syntaxes, ts);
        }
        if options.offer_explicit_syntax {
            push_unique(&mut syntaxes, uids::EXPLICIT_VR_LITTLE_ENDIAN);
        }
        push_unique(&mut syntaxes, uids::IMPLICIT_VR_LITTLE_ENDIAN);

        if options.serialized_presentation_contexts {
            for ts in syntaxes {
                proposals.push((sop_class.clone(), vec![ts]));
            }
        } else {
            proposals.push((sop_class.clone(), syntaxes));
        }
    }
    proposals
}

fn push_unique(list: &mut Vec<String>, transfer_syntax: &str) {
    if !list.iter().any(|ts| ts == transfer_syntax) {
        list.push(transfer_syntax.to_string());
    }
}

/// Translate the client configuration
/// into upper layer association options.
fn association_options(
    options: &StoreClientOptions,
    proposals: Vec<(String, Vec<String>)>,
) -> ClientAssociationOptions<'static> {
    let mut builder = ClientAssociationOptions::new()
        .calling_ae_title(options.calling_ae_title.clone())
        .max_pdu_length(options.max_pdu_length)
        .connection_timeout(options.connect_timeout)
        .read_timeout(options.socket_timeout)
        .write_timeout(options.socket_timeout)
        .dimse_timeout(options.dimse_timeout);
    if let Some(called) = &options.called_ae_title {
        builder = builder.called_ae_title(called.clone());
    }
    if let Some(rate) = options.throttle_speed {
        builder = builder.throttle_speed(rate);
    }
    for (abstract_syntax, transfer_syntaxes) in proposals {
        builder = builder.with_presentation_context(abstract_syntax, transfer_syntaxes);
    }
    builder
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}
