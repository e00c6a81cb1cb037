//! End-to-end tests of the C-STORE service class user,
//! against an in-process acceptor.
use std::net::{SocketAddr, TcpListener};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use courier_store::dimse::{AssemblerOptions, DimseAssembler, DimsePayload};
use courier_store::service::{serve, ServiceHandlers, ServiceReply};
use courier_store::store::{RequestStatus, StoreClient, StoreClientOptions, StoreObserver};
use courier_store::{CStoreRequest, CommandSet, Error};
use courier_ul::ServerAssociationOptions;

use dicom_core::{dicom_value, DataElement, VR};
use dicom_dictionary_std::{tags, uids};
use dicom_object::{FileMetaTableBuilder, InMemDicomObject};

static IMPLICIT_VR_LE: &str = "1.2.840.10008.1.2";
static EXPLICIT_VR_LE: &str = "1.2.840.10008.1.2.1";

/// Write a small DICOM file for testing.
fn create_dicom_file(path: &Path, sop_class_uid: &str, sop_instance_uid: &str, ts: &str) {
    let obj = InMemDicomObject::from_element_iter([
        DataElement::new(tags::SOP_CLASS_UID, VR::UI, dicom_value!(Str, sop_class_uid)),
        DataElement::new(
            tags::SOP_INSTANCE_UID,
            VR::UI,
            dicom_value!(Str, sop_instance_uid),
        ),
        DataElement::new(tags::PATIENT_NAME, VR::PN, dicom_value!(Str, "Doe^John")),
        DataElement::new(tags::PATIENT_ID, VR::LO, dicom_value!(Str, "0001")),
        DataElement::new(
            tags::STUDY_DESCRIPTION,
            VR::LO,
            dicom_value!(Str, "loopback test study"),
        ),
    ]);
    let meta = FileMetaTableBuilder::new()
        .media_storage_sop_class_uid(sop_class_uid)
        .media_storage_sop_instance_uid(sop_instance_uid)
        .transfer_syntax(ts)
        .build()
        .expect("file meta information");
    obj.with_exact_meta(meta)
        .write_to_file(path)
        .expect("write test DICOM file");
}

/// The data set portion of a stored DICOM file,
/// past the preamble and file meta group.
fn data_set_bytes(path: &Path) -> Vec<u8> {
    use std::io::Read;
    let mut file = std::fs::File::open(path).unwrap();
    let mut preamble = [0_u8; 128];
    file.read_exact(&mut preamble).unwrap();
    dicom_object::meta::FileMetaTable::from_reader(&mut file).unwrap();
    let mut rest = Vec::new();
    file.read_to_end(&mut rest).unwrap();
    rest
}

#[derive(Default)]
struct Received {
    commands: Vec<CommandSet>,
    datasets: Vec<Vec<u8>>,
}

struct RecordingScp {
    received: Arc<Mutex<Received>>,
}

impl ServiceHandlers for RecordingScp {
    fn on_c_store_rq(
        &mut self,
        command: &CommandSet,
        dataset: Option<&DimsePayload>,
    ) -> ServiceReply {
        let mut received = self.received.lock().unwrap();
        received.commands.push(command.clone());
        match dataset {
            Some(DimsePayload::InMemory(data)) => received.datasets.push(data.clone()),
            Some(DimsePayload::Spilled { path, .. }) => {
                received.datasets.push(std::fs::read(path).unwrap())
            }
            None => received.datasets.push(Vec::new()),
        }
        ServiceReply::Command(CommandSet::c_store_rsp(command, 0x0000))
    }
}

/// Spawn an SCP which accepts `association_count` associations in sequence
/// and records every C-STORE request.
fn spawn_scp(
    abstract_syntaxes: &[&str],
    transfer_syntaxes: &[&str],
    association_count: usize,
) -> (JoinHandle<()>, SocketAddr, Arc<Mutex<Received>>) {
    let listener = TcpListener::bind("localhost:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let mut options = ServerAssociationOptions::new()
        .accept_any()
        .ae_title("STORE-SCP");
    for uid in abstract_syntaxes {
        options = options.with_abstract_syntax(uid.to_string());
    }
    for uid in transfer_syntaxes {
        options = options.with_transfer_syntax(uid.to_string());
    }
    let received = Arc::new(Mutex::new(Received::default()));
    let received_in_scp = Arc::clone(&received);

    let handle = std::thread::spawn(move || {
        for _ in 0..association_count {
            let (stream, _peer) = listener.accept().unwrap();
            let association = match options.establish(stream) {
                Ok(a) => a,
                Err(_) => continue,
            };
            let mut handlers = RecordingScp {
                received: Arc::clone(&received_in_scp),
            };
            let _ = serve(association, &mut handlers, DimseAssembler::new(AssemblerOptions::default()));
        }
    });
    (handle, addr, received)
}

#[derive(Default)]
struct Counters {
    responses: AtomicUsize,
    completed: AtomicUsize,
    failed: AtomicUsize,
    complete_fired: AtomicBool,
    closed_fired: AtomicBool,
    network_errors: AtomicUsize,
}

struct CountingObserver {
    counters: Arc<Counters>,
}

impl StoreObserver for CountingObserver {
    fn on_response(&self, _request: &CStoreRequest, _status: u16) {
        self.counters.responses.fetch_add(1, Ordering::SeqCst);
    }
    fn on_request_complete(&self, _request: &CStoreRequest) {
        self.counters.completed.fetch_add(1, Ordering::SeqCst);
    }
    fn on_request_failed(&self, _request: &CStoreRequest) {
        self.counters.failed.fetch_add(1, Ordering::SeqCst);
    }
    fn on_complete(&self) {
        self.counters.complete_fired.store(true, Ordering::SeqCst);
    }
    fn on_closed(&self, _closed_on_error: bool) {
        self.counters.closed_fired.store(true, Ordering::SeqCst);
    }
    fn on_network_error(&self, _error: &Error) {
        self.counters.network_errors.fetch_add(1, Ordering::SeqCst);
    }
}

/// Store two CT files whose transfer syntax the peer accepts directly.
/// The data sets travel bit-for-bit, straight from the files.
#[test]
fn store_two_files_same_transfer_syntax() {
    let dir = tempfile::tempdir().unwrap();
    let file_1 = dir.path().join("ct-001.dcm");
    let file_2 = dir.path().join("ct-002.dcm");
    create_dicom_file(&file_1, uids::CT_IMAGE_STORAGE, "1.2.3.1", EXPLICIT_VR_LE);
    create_dicom_file(&file_2, uids::CT_IMAGE_STORAGE, "1.2.3.2", EXPLICIT_VR_LE);

    let (scp, addr, received) = spawn_scp(
        &[uids::CT_IMAGE_STORAGE],
        &[EXPLICIT_VR_LE, IMPLICIT_VR_LE],
        1,
    );

    let counters = Arc::new(Counters::default());
    let mut client = StoreClient::new(StoreClientOptions {
        calling_ae_title: "STORE-SCU".into(),
        ..Default::default()
    })
    .with_observer(CountingObserver {
        counters: Arc::clone(&counters),
    });

    let handle_1 = client.add_file(&file_1);
    let handle_2 = client.add_file_with_state(&file_2, Box::new(42_u32));
    client.send_to(&addr.to_string()).unwrap();
    client.wait().unwrap();

    assert_eq!(client.queued(), 0);
    assert_eq!(handle_1.lock().unwrap().status(), RequestStatus::Success);
    assert_eq!(handle_2.lock().unwrap().status(), RequestStatus::Success);
    // after unloading, the effective transfer syntax reverts
    assert_eq!(
        handle_1.lock().unwrap().effective_transfer_syntax(),
        EXPLICIT_VR_LE
    );
    assert!(!handle_1.lock().unwrap().is_loaded());
    // application data rides along with the request
    assert_eq!(
        handle_2
            .lock()
            .unwrap()
            .user_state()
            .and_then(|state| state.downcast_ref::<u32>())
            .copied(),
        Some(42)
    );

    assert_eq!(counters.responses.load(Ordering::SeqCst), 2);
    assert_eq!(counters.completed.load(Ordering::SeqCst), 2);
    assert_eq!(counters.failed.load(Ordering::SeqCst), 0);
    assert!(counters.complete_fired.load(Ordering::SeqCst));
    assert!(counters.closed_fired.load(Ordering::SeqCst));

    scp.join().unwrap();
    let received = received.lock().unwrap();
    assert_eq!(received.commands.len(), 2);
    assert_eq!(
        received.commands[0].affected_sop_instance_uid.as_deref(),
        Some("1.2.3.1")
    );
    // the file was streamed without re-encoding:
    // the received data set equals the file's data set portion
    assert_eq!(received.datasets[0], data_set_bytes(&file_1));
    assert_eq!(received.datasets[1], data_set_bytes(&file_2));
}

/// The peer only accepts Implicit VR Little Endian:
/// the data set is re-serialized under the accepted syntax.
#[test]
fn store_falls_back_to_implicit_vr() {
    let dir = tempfile::tempdir().unwrap();
    let file = dir.path().join("ct-explicit.dcm");
    create_dicom_file(&file, uids::CT_IMAGE_STORAGE, "1.2.3.9", EXPLICIT_VR_LE);

    let (scp, addr, received) = spawn_scp(&[uids::CT_IMAGE_STORAGE], &[IMPLICIT_VR_LE], 1);

    let mut client = StoreClient::new(StoreClientOptions {
        calling_ae_title: "STORE-SCU".into(),
        ..Default::default()
    });
    let handle = client.add_file(&file);
    client.send_to(&addr.to_string()).unwrap();
    client.wait().unwrap();

    assert_eq!(handle.lock().unwrap().status(), RequestStatus::Success);

    scp.join().unwrap();
    let received = received.lock().unwrap();
    assert_eq!(received.commands.len(), 1);

    // the received data set decodes under Implicit VR Little Endian
    let obj = InMemDicomObject::read_dataset_with_ts(
        received.datasets[0].as_slice(),
        &dicom_transfer_syntax_registry::entries::IMPLICIT_VR_LITTLE_ENDIAN.erased(),
    )
    .expect("data set should be implicit VR");
    assert_eq!(
        obj.element(tags::SOP_INSTANCE_UID)
            .unwrap()
            .to_str()
            .unwrap()
            .trim_end_matches('\0'),
        "1.2.3.9"
    );
}

/// A SOP class the peer refuses fails its own request
/// and the other queued requests continue.
#[test]
fn unsupported_sop_class_fails_only_that_request() {
    let dir = tempfile::tempdir().unwrap();
    let ct_file = dir.path().join("ct.dcm");
    let mr_file = dir.path().join("mr.dcm");
    create_dicom_file(&ct_file, uids::CT_IMAGE_STORAGE, "1.2.3.10", EXPLICIT_VR_LE);
    create_dicom_file(&mr_file, uids::MR_IMAGE_STORAGE, "1.2.3.11", EXPLICIT_VR_LE);

    // the SCP only takes CT
    let (scp, addr, received) = spawn_scp(
        &[uids::CT_IMAGE_STORAGE],
        &[EXPLICIT_VR_LE, IMPLICIT_VR_LE],
        1,
    );

    let counters = Arc::new(Counters::default());
    let mut client = StoreClient::new(StoreClientOptions {
        calling_ae_title: "STORE-SCU".into(),
        ..Default::default()
    })
    .with_observer(CountingObserver {
        counters: Arc::clone(&counters),
    });

    let ct_handle = client.add_file(&ct_file);
    let mr_handle = client.add_file(&mr_file);
    client.send_to(&addr.to_string()).unwrap();
    client.wait().unwrap();

    assert_eq!(ct_handle.lock().unwrap().status(), RequestStatus::Success);
    assert_eq!(
        mr_handle.lock().unwrap().status(),
        RequestStatus::SopClassNotSupported
    );
    assert_eq!(counters.failed.load(Ordering::SeqCst), 1);
    assert_eq!(counters.completed.load(Ordering::SeqCst), 1);

    scp.join().unwrap();
    let received = received.lock().unwrap();
    assert_eq!(received.commands.len(), 1);
    assert_eq!(
        received.commands[0].affected_sop_class_uid.as_deref(),
        Some(uids::CT_IMAGE_STORAGE)
    );
}

/// A file that does not parse is never enqueued;
/// its handle reports the failure.
#[test]
fn broken_file_is_not_enqueued() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("not-dicom.dcm");
    std::fs::write(&path, b"certainly not a DICOM file").unwrap();

    let client = StoreClient::new(StoreClientOptions::default());
    let handle = client.add_file(&path);

    assert_eq!(client.queued(), 0);
    let request = handle.lock().unwrap();
    assert_eq!(request.status(), RequestStatus::ProcessingFailure);
    assert!(request.last_error().is_some());
}

/// Cancelling with wait after the second response
/// releases the association before the third request
/// and leaves the rest of the queue untouched.
#[test]
fn cancel_with_wait_preserves_remaining_queue() {
    let dir = tempfile::tempdir().unwrap();
    let mut files = Vec::new();
    for i in 0..5 {
        let path = dir.path().join(format!("ct-{:03}.dcm", i));
        create_dicom_file(
            &path,
            uids::CT_IMAGE_STORAGE,
            &format!("1.2.4.{}", i),
            EXPLICIT_VR_LE,
        );
        files.push(path);
    }

    let (scp, addr, received) = spawn_scp(
        &[uids::CT_IMAGE_STORAGE],
        &[EXPLICIT_VR_LE, IMPLICIT_VR_LE],
        1,
    );

    struct CancelAfterTwo {
        responses: Arc<AtomicUsize>,
        cancel: courier_store::CancelHandle,
        complete_fired: Arc<AtomicBool>,
        closed_fired: Arc<AtomicBool>,
    }
    impl StoreObserver for CancelAfterTwo {
        fn on_response(&self, _request: &CStoreRequest, _status: u16) {
            if self.responses.fetch_add(1, Ordering::SeqCst) + 1 == 2 {
                self.cancel.cancel();
            }
        }
        fn on_complete(&self) {
            self.complete_fired.store(true, Ordering::SeqCst);
        }
        fn on_closed(&self, _closed_on_error: bool) {
            self.closed_fired.store(true, Ordering::SeqCst);
        }
    }

    let responses = Arc::new(AtomicUsize::new(0));
    let complete_fired = Arc::new(AtomicBool::new(false));
    let closed_fired = Arc::new(AtomicBool::new(false));

    let mut client = StoreClient::new(StoreClientOptions {
        calling_ae_title: "STORE-SCU".into(),
        // plenty of linger so that an early drain cannot mask the cancel
        linger: Duration::from_secs(30),
        ..Default::default()
    });
    let observer = CancelAfterTwo {
        responses: Arc::clone(&responses),
        cancel: client.cancel_handle(),
        complete_fired: Arc::clone(&complete_fired),
        closed_fired: Arc::clone(&closed_fired),
    };
    let mut client = client.with_observer(observer);

    for file in &files {
        client.add_file(file);
    }
    client.send_to(&addr.to_string()).unwrap();
    client.wait().unwrap();

    assert_eq!(client.queued(), 3, "the remaining requests stay queued");
    assert_eq!(responses.load(Ordering::SeqCst), 2);
    assert!(
        !complete_fired.load(Ordering::SeqCst),
        "on_complete must not fire after cancel"
    );
    assert!(
        closed_fired.load(Ordering::SeqCst),
        "on_closed must fire after cancel"
    );

    scp.join().unwrap();
    assert_eq!(received.lock().unwrap().commands.len(), 2);
}

/// Losing the transport mid-exchange resets the request,
/// reconnects, and retries it once from scratch.
#[test]
fn transport_loss_triggers_reconnect_and_retry() {
    let dir = tempfile::tempdir().unwrap();
    let file = dir.path().join("ct-lossy-link.dcm");
    create_dicom_file(&file, uids::CT_IMAGE_STORAGE, "1.2.5.1", EXPLICIT_VR_LE);

    let listener = TcpListener::bind("localhost:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let received = Arc::new(Mutex::new(Received::default()));
    let received_in_scp = Arc::clone(&received);

    let scp = std::thread::spawn(move || {
        let options = ServerAssociationOptions::new()
            .accept_any()
            .ae_title("STORE-SCP")
            .with_abstract_syntax(uids::CT_IMAGE_STORAGE)
            .with_transfer_syntax(EXPLICIT_VR_LE)
            .with_transfer_syntax(IMPLICIT_VR_LE);

        // first association: accept, swallow one PDU, then drop the socket
        let (stream, _peer) = listener.accept().unwrap();
        {
            let mut association = options.establish(stream).unwrap();
            let _ = association.receive();
            // connection dropped here
        }

        // second association: behave properly
        let (stream, _peer) = listener.accept().unwrap();
        let association = options.establish(stream).unwrap();
        let mut handlers = RecordingScp {
            received: received_in_scp,
        };
        let _ = serve(association, &mut handlers, DimseAssembler::new(AssemblerOptions::default()));
    });

    let counters = Arc::new(Counters::default());
    let mut client = StoreClient::new(StoreClientOptions {
        calling_ae_title: "STORE-SCU".into(),
        ..Default::default()
    })
    .with_observer(CountingObserver {
        counters: Arc::clone(&counters),
    });

    let handle = client.add_file(&file);
    client.send_to(&addr.to_string()).unwrap();
    client.wait().unwrap();

    assert_eq!(handle.lock().unwrap().status(), RequestStatus::Success);
    assert_eq!(client.queued(), 0);
    assert_eq!(counters.network_errors.load(Ordering::SeqCst), 1);
    assert_eq!(counters.responses.load(Ordering::SeqCst), 1);

    scp.join().unwrap();
    // the request went out exactly twice, stored exactly once
    assert_eq!(received.lock().unwrap().commands.len(), 1);
}

/// The verification service answers a C-ECHO with success.
#[test]
fn verify_performs_c_echo() {
    let listener = TcpListener::bind("localhost:0").unwrap();
    let addr = listener.local_addr().unwrap();

    let scp = std::thread::spawn(move || {
        let options = ServerAssociationOptions::new()
            .accept_any()
            .ae_title("ECHO-SCP")
            .with_abstract_syntax(uids::VERIFICATION);
        let (stream, _peer) = listener.accept().unwrap();
        let association = options.establish(stream).unwrap();
        // the default handlers answer C-ECHO with success
        struct Echo;
        impl ServiceHandlers for Echo {}
        let _ = serve(association, &mut Echo, DimseAssembler::new(AssemblerOptions::default()));
    });

    let client = StoreClient::new(StoreClientOptions {
        calling_ae_title: "ECHO-SCU".into(),
        ..Default::default()
    });
    let status = client.verify(&addr.to_string()).unwrap();
    assert_eq!(status, 0x0000);

    scp.join().unwrap();
}
