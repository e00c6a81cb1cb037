//! Background preloading of queued requests.
use std::sync::mpsc;
use std::sync::Arc;
use std::thread::JoinHandle;

use courier_ul::pdu::PresentationContextNegotiated;
use tracing::debug;

use crate::codec::PixelDataCodec;

use super::request::{self, LoadPolicy, RequestHandle};
use super::StoreClientOptions;

/// A batch of requests to load ahead of the sender,
/// against the presentation contexts of the running association.
pub(crate) struct PreloadBatch {
    pub handles: Vec<RequestHandle>,
    pub contexts: Arc<Vec<PresentationContextNegotiated>>,
}

/// The single background worker which loads request payloads
/// before the sender gets to them.
///
/// Loads are idempotent: the sender's own on-demand load
/// and the preloader resolve races through the request's
/// loaded flag, so whoever comes second is a no-op.
/// The worker never unloads; the sender unloads after each send
/// to cap memory usage.
pub(crate) struct Preloader {
    sender: mpsc::Sender<PreloadBatch>,
    worker: Option<JoinHandle<()>>,
}

impl Preloader {
    pub fn new(options: Arc<StoreClientOptions>, codec: Arc<dyn PixelDataCodec>) -> Self {
        let (sender, receiver) = mpsc::channel::<PreloadBatch>();
        let worker = std::thread::spawn(move || {
            while let Ok(batch) = receiver.recv() {
                let policy = LoadPolicy {
                    disable_file_streaming: options.disable_file_streaming,
                    preferred_transfer_syntax: options.preferred_transfer_syntax.as_deref(),
                    preferred_transfer_syntax_params: options
                        .preferred_transfer_syntax_params
                        .as_ref(),
                    codec: codec.as_ref(),
                };
                for handle in batch.handles {
                    let mut request = handle.lock().unwrap_or_else(|e| e.into_inner());
                    if request.is_loaded() {
                        continue;
                    }
                    if let Err(e) = request::load(&mut request, &batch.contexts, &policy) {
                        // leave the outcome to the sender's own load
                        debug!(
                            "preload of {} put aside: {}",
                            request.file_name.display(),
                            e
                        );
                    }
                }
            }
        });
        Preloader {
            sender,
            worker: Some(worker),
        }
    }

    /// Obtain a handle for submitting batches to the worker.
    pub fn sender(&self) -> mpsc::Sender<PreloadBatch> {
        self.sender.clone()
    }
}

impl Drop for Preloader {
    fn drop(&mut self) {
        // closing the channel lets the worker run dry and stop
        let (closed, _) = mpsc::channel();
        self.sender = closed;
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;
    use std::sync::Mutex;
    use std::time::{Duration, Instant};

    use courier_ul::pdu::PresentationContextResultReason;
    use dicom_core::{dicom_value, DataElement, VR};
    use dicom_dictionary_std::{tags, uids};
    use dicom_object::{FileMetaTableBuilder, InMemDicomObject};

    use crate::codec::RegistryCodec;

    fn create_dicom_file(path: &Path, sop_instance_uid: &str) {
        let obj = InMemDicomObject::from_element_iter([
            DataElement::new(
                tags::SOP_CLASS_UID,
                VR::UI,
                dicom_value!(Str, uids::CT_IMAGE_STORAGE),
            ),
            DataElement::new(
                tags::SOP_INSTANCE_UID,
                VR::UI,
                dicom_value!(Str, sop_instance_uid),
            ),
            DataElement::new(tags::PATIENT_ID, VR::LO, dicom_value!(Str, "0001")),
        ]);
        let meta = FileMetaTableBuilder::new()
            .media_storage_sop_class_uid(uids::CT_IMAGE_STORAGE)
            .media_storage_sop_instance_uid(sop_instance_uid)
            .transfer_syntax(uids::EXPLICIT_VR_LITTLE_ENDIAN)
            .build()
            .expect("file meta information");
        obj.with_exact_meta(meta)
            .write_to_file(path)
            .expect("write test DICOM file");
    }

    /// The sender's on-demand load and the background preloader
    /// resolve their race through the request's loaded flag:
    /// whoever comes second is a no-op.
    #[test]
    fn racing_load_after_preload_is_a_noop() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ct.dcm");
        create_dicom_file(&path, "1.2.3.4");

        let handle: RequestHandle = Arc::new(Mutex::new(
            request::parse_file(&path, None).expect("parse test file"),
        ));
        // the peer only takes implicit VR,
        // so loading materializes the data set in memory
        let contexts = Arc::new(vec![PresentationContextNegotiated {
            id: 1,
            reason: PresentationContextResultReason::Acceptance,
            transfer_syntax: uids::IMPLICIT_VR_LITTLE_ENDIAN.to_string(),
            abstract_syntax: uids::CT_IMAGE_STORAGE.to_string(),
        }]);

        let options = Arc::new(StoreClientOptions {
            preload_count: 1,
            ..Default::default()
        });
        let preloader = Preloader::new(Arc::clone(&options), Arc::new(RegistryCodec));
        preloader
            .sender()
            .send(PreloadBatch {
                handles: vec![Arc::clone(&handle)],
                contexts: Arc::clone(&contexts),
            })
            .expect("preloader accepts the batch");

        // wait for the background load to land
        let deadline = Instant::now() + Duration::from_secs(5);
        while !handle.lock().unwrap().is_loaded() {
            assert!(
                Instant::now() < deadline,
                "preloader did not load the request"
            );
            std::thread::sleep(Duration::from_millis(10));
        }

        // with the file gone, anything but a no-op would fail
        std::fs::remove_file(&path).unwrap();

        let policy = LoadPolicy {
            disable_file_streaming: options.disable_file_streaming,
            preferred_transfer_syntax: options.preferred_transfer_syntax.as_deref(),
            preferred_transfer_syntax_params: options.preferred_transfer_syntax_params.as_ref(),
            codec: &RegistryCodec,
        };
        let mut req = handle.lock().unwrap();
        request::load(&mut req, &contexts, &policy).expect("second load must be a no-op");
        assert!(req.is_loaded());
        assert!(req.dataset.is_some());
        assert_eq!(
            req.effective_transfer_syntax(),
            uids::IMPLICIT_VR_LITTLE_ENDIAN
        );
    }
}
