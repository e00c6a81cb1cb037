//! File-backed C-STORE requests and their loading rules.
use std::any::Any;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use courier_ul::pdu::{PresentationContextNegotiated, PresentationContextResultReason};
use dicom_core::header::Tag;
use dicom_dictionary_std::uids;
use dicom_object::{DefaultDicomObject, OpenFileOptions};
use snafu::{OptionExt, ResultExt};

use crate::codec::{is_encapsulated, CodecParams, PixelDataCodec};
use crate::{Error, NoAcceptedContextSnafu, Result};

/// A shared handle to a queued request.
///
/// The session thread and the preloader both resolve races
/// through the request's own lock and loaded flag:
/// whoever comes second finds the payload already loaded
/// and does nothing.
pub type RequestHandle = Arc<Mutex<CStoreRequest>>;

/// The outcome of a request so far.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestStatus {
    /// Not sent yet
    Pending,
    /// Stored with status success
    Success,
    /// Stored, but the peer reported this warning status
    Warning(u16),
    /// The peer reported this failure status
    Failure(u16),
    /// The request could not be prepared
    /// (parse or transcoding failure)
    ProcessingFailure,
    /// The association offers no usable presentation context
    /// for the request's SOP class
    SopClassNotSupported,
}

/// One queued C-STORE request, backed by a DICOM file.
pub struct CStoreRequest {
    /// The DICOM file holding the data set
    pub file_name: PathBuf,
    /// The storage SOP class UID from the file meta group
    pub sop_class_uid: String,
    /// The storage SOP instance UID from the file meta group
    pub sop_instance_uid: String,
    /// The transfer syntax the file is encoded in
    pub original_transfer_syntax: String,
    pub(crate) effective_transfer_syntax: String,
    pub(crate) status: RequestStatus,
    pub(crate) last_error: Option<String>,
    pub(crate) user_state: Option<Box<dyn Any + Send>>,
    pub(crate) loaded: bool,
    pub(crate) dataset: Option<DefaultDicomObject>,
    pub(crate) stream_from_file: bool,
}

impl std::fmt::Debug for CStoreRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CStoreRequest")
            .field("file_name", &self.file_name)
            .field("sop_class_uid", &self.sop_class_uid)
            .field("sop_instance_uid", &self.sop_instance_uid)
            .field("original_transfer_syntax", &self.original_transfer_syntax)
            .field("effective_transfer_syntax", &self.effective_transfer_syntax)
            .field("status", &self.status)
            .field("last_error", &self.last_error)
            .field("loaded", &self.loaded)
            .field("stream_from_file", &self.stream_from_file)
            .finish()
    }
}

impl CStoreRequest {
    /// The outcome of the request so far.
    pub fn status(&self) -> RequestStatus {
        self.status
    }

    /// The last error recorded for this request, if any.
    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    /// The transfer syntax the request will be (or was) sent in.
    ///
    /// Reverts to the file's own transfer syntax when unloaded.
    pub fn effective_transfer_syntax(&self) -> &str {
        &self.effective_transfer_syntax
    }

    /// Whether the payload is currently loaded.
    pub fn is_loaded(&self) -> bool {
        self.loaded
    }

    /// Application data attached to this request.
    pub fn user_state(&self) -> Option<&(dyn Any + Send)> {
        self.user_state.as_deref()
    }

    pub(crate) fn new(
        file_name: PathBuf,
        sop_class_uid: String,
        sop_instance_uid: String,
        transfer_syntax: String,
        user_state: Option<Box<dyn Any + Send>>,
    ) -> Self {
        CStoreRequest {
            file_name,
            sop_class_uid,
            sop_instance_uid,
            effective_transfer_syntax: transfer_syntax.clone(),
            original_transfer_syntax: transfer_syntax,
            status: RequestStatus::Pending,
            last_error: None,
            user_state,
            loaded: false,
            dataset: None,
            stream_from_file: false,
        }
    }

    /// Build a request marked as failed from the start,
    /// for files which could not be parsed.
    pub(crate) fn failed(
        file_name: PathBuf,
        error: &Error,
        user_state: Option<Box<dyn Any + Send>>,
    ) -> Self {
        CStoreRequest {
            file_name,
            sop_class_uid: String::new(),
            sop_instance_uid: String::new(),
            original_transfer_syntax: String::new(),
            effective_transfer_syntax: String::new(),
            status: RequestStatus::ProcessingFailure,
            last_error: Some(error.to_string()),
            user_state,
            loaded: false,
            dataset: None,
            stream_from_file: false,
        }
    }
}

/// Parse the file meta information of a DICOM file
/// into a pending request.
///
/// Only the file meta group is read;
/// when `field_extractor` is given,
/// the data set is additionally parsed up to (but excluding)
/// the pixel data, and handed to the extractor
/// so that application data can be derived from its attributes.
pub(crate) fn parse_file(
    path: &Path,
    field_extractor: Option<&dyn Fn(&DefaultDicomObject) -> Option<Box<dyn Any + Send>>>,
) -> Result<CStoreRequest> {
    let stop_tag = if field_extractor.is_some() {
        dicom_dictionary_std::tags::PIXEL_DATA
    } else {
        Tag(0x0001, 0x0000)
    };
    let obj = OpenFileOptions::new()
        .read_until(stop_tag)
        .open_file(path)
        .with_whatever_context(|_| format!("could not open DICOM file {}", path.display()))?;

    let meta = obj.meta();
    let sop_class_uid = trimmed(&meta.media_storage_sop_class_uid);
    let sop_instance_uid = trimmed(&meta.media_storage_sop_instance_uid);
    let transfer_syntax = trimmed(&meta.transfer_syntax);

    let user_state = field_extractor.and_then(|extract| extract(&obj));

    Ok(CStoreRequest::new(
        path.to_path_buf(),
        sop_class_uid,
        sop_instance_uid,
        transfer_syntax,
        user_state,
    ))
}

fn trimmed(uid: &str) -> String {
    uid.trim_end_matches(|c: char| c.is_whitespace() || c == '\0')
        .to_string()
}

/// The pieces of configuration which govern request loading.
pub(crate) struct LoadPolicy<'a> {
    pub disable_file_streaming: bool,
    pub preferred_transfer_syntax: Option<&'a str>,
    pub preferred_transfer_syntax_params: Option<&'a CodecParams>,
    pub codec: &'a dyn PixelDataCodec,
}

/// Resolve the request's effective transfer syntax
/// against the negotiated contexts and load its payload.
///
/// Loading is idempotent: a request already loaded is left alone.
/// When the accepted transfer syntax matches the file's own
/// and file streaming is allowed,
/// the data set stays on disk and is streamed at send time;
/// otherwise the data set is loaded in full,
/// transcoding it when the accepted transfer syntax differs.
pub(crate) fn load(
    request: &mut CStoreRequest,
    contexts: &[PresentationContextNegotiated],
    policy: &LoadPolicy<'_>,
) -> Result<()> {
    if request.loaded {
        return Ok(());
    }

    let target_ts = choose_transfer_syntax(
        contexts,
        &request.sop_class_uid,
        &request.original_transfer_syntax,
        policy,
    )
    .with_context(|| NoAcceptedContextSnafu {
        sop_class_uid: request.sop_class_uid.clone(),
    })?;

    if target_ts == request.original_transfer_syntax && !policy.disable_file_streaming {
        // same encoding on both ends: the already-framed data set bytes
        // can go out straight from the file
        request.stream_from_file = true;
        request.effective_transfer_syntax = target_ts;
        request.loaded = true;
        return Ok(());
    }

    let mut obj = dicom_object::open_file(&request.file_name).with_whatever_context(|_| {
        format!("could not open DICOM file {}", request.file_name.display())
    })?;

    if target_ts != request.original_transfer_syntax {
        if is_encapsulated(&request.original_transfer_syntax) {
            // decompress to the native form first
            policy.codec.decode(&mut obj)?;
        }
        if is_encapsulated(&target_ts) {
            let params = policy
                .preferred_transfer_syntax
                .filter(|preferred| *preferred == target_ts)
                .and(policy.preferred_transfer_syntax_params);
            policy.codec.encode(&mut obj, &target_ts, params)?;
        }
        // a codec-free target needs no codec step:
        // the data set is re-serialized under the target syntax at send time
    }

    request.dataset = Some(obj);
    request.effective_transfer_syntax = target_ts;
    request.loaded = true;
    Ok(())
}

/// Release the loaded payload.
///
/// The effective transfer syntax reverts to the file's own.
pub(crate) fn unload(request: &mut CStoreRequest) {
    request.dataset = None;
    request.stream_from_file = false;
    request.loaded = false;
    request.effective_transfer_syntax = request.original_transfer_syntax.clone();
}

/// Return the request to its pristine pending state,
/// ready to be retried from scratch.
pub(crate) fn reset(request: &mut CStoreRequest) {
    unload(request);
    request.status = RequestStatus::Pending;
    request.last_error = None;
}

/// Pick the transfer syntax to send this SOP class under,
/// out of the accepted presentation contexts.
///
/// The file's own transfer syntax wins when accepted;
/// then any accepted context which is codec free on both ends;
/// then, if the file can be decoded,
/// a transcoding target in order of preference:
/// the preferred transfer syntax, Explicit VR Little Endian,
/// Implicit VR Little Endian,
/// and finally any accepted syntax with a registered codec.
fn choose_transfer_syntax(
    contexts: &[PresentationContextNegotiated],
    sop_class_uid: &str,
    file_ts: &str,
    policy: &LoadPolicy<'_>,
) -> Option<String> {
    let accepted: Vec<_> = contexts
        .iter()
        .filter(|pc| {
            pc.reason == PresentationContextResultReason::Acceptance
                && pc.abstract_syntax == sop_class_uid
        })
        .collect();
    if accepted.is_empty() {
        return None;
    }

    // the file's own encoding, no conversion needed
    if accepted.iter().any(|pc| pc.transfer_syntax == file_ts) {
        return Some(file_ts.to_string());
    }

    // uncompressed on both ends: plain re-serialization will do
    if !is_encapsulated(file_ts) {
        if let Some(pc) = accepted
            .iter()
            .find(|pc| !is_encapsulated(&pc.transfer_syntax))
        {
            return Some(pc.transfer_syntax.clone());
        }
    }

    // transcoding is required from here on
    if is_encapsulated(file_ts) && !policy.codec.has_codec(file_ts) {
        return None;
    }

    let accepts = |ts: &str| accepted.iter().any(|pc| pc.transfer_syntax == ts);
    if let Some(preferred) = policy.preferred_transfer_syntax {
        if accepts(preferred) && (!is_encapsulated(preferred) || policy.codec.has_codec(preferred))
        {
            return Some(preferred.to_string());
        }
    }
    if accepts(uids::EXPLICIT_VR_LITTLE_ENDIAN) {
        return Some(uids::EXPLICIT_VR_LITTLE_ENDIAN.to_string());
    }
    if accepts(uids::IMPLICIT_VR_LITTLE_ENDIAN) {
        return Some(uids::IMPLICIT_VR_LITTLE_ENDIAN.to_string());
    }
    accepted
        .iter()
        .find(|pc| policy.codec.has_codec(&pc.transfer_syntax))
        .map(|pc| pc.transfer_syntax.clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::RegistryCodec;

    fn accepted(id: u8, abstract_syntax: &str, transfer_syntax: &str) -> PresentationContextNegotiated {
        PresentationContextNegotiated {
            id,
            reason: PresentationContextResultReason::Acceptance,
            transfer_syntax: transfer_syntax.to_string(),
            abstract_syntax: abstract_syntax.to_string(),
        }
    }

    fn policy(codec: &RegistryCodec) -> LoadPolicy<'_> {
        LoadPolicy {
            disable_file_streaming: false,
            preferred_transfer_syntax: None,
            preferred_transfer_syntax_params: None,
            codec,
        }
    }

    #[test]
    fn same_transfer_syntax_wins() {
        let codec = RegistryCodec;
        let contexts = vec![
            accepted(1, uids::CT_IMAGE_STORAGE, uids::IMPLICIT_VR_LITTLE_ENDIAN),
            accepted(3, uids::CT_IMAGE_STORAGE, uids::EXPLICIT_VR_LITTLE_ENDIAN),
        ];
        let ts = choose_transfer_syntax(
            &contexts,
            uids::CT_IMAGE_STORAGE,
            uids::EXPLICIT_VR_LITTLE_ENDIAN,
            &policy(&codec),
        );
        assert_eq!(ts.as_deref(), Some(uids::EXPLICIT_VR_LITTLE_ENDIAN));
    }

    #[test]
    fn uncompressed_fallback_without_codec() {
        let codec = RegistryCodec;
        // peer only takes implicit VR
        let contexts = vec![accepted(
            1,
            uids::CT_IMAGE_STORAGE,
            uids::IMPLICIT_VR_LITTLE_ENDIAN,
        )];
        let ts = choose_transfer_syntax(
            &contexts,
            uids::CT_IMAGE_STORAGE,
            uids::EXPLICIT_VR_LITTLE_ENDIAN,
            &policy(&codec),
        );
        assert_eq!(ts.as_deref(), Some(uids::IMPLICIT_VR_LITTLE_ENDIAN));
    }

    #[test]
    fn no_context_for_the_sop_class() {
        let codec = RegistryCodec;
        let contexts = vec![accepted(
            1,
            uids::MR_IMAGE_STORAGE,
            uids::IMPLICIT_VR_LITTLE_ENDIAN,
        )];
        let ts = choose_transfer_syntax(
            &contexts,
            uids::CT_IMAGE_STORAGE,
            uids::EXPLICIT_VR_LITTLE_ENDIAN,
            &policy(&codec),
        );
        assert_eq!(ts, None);
    }

    #[test]
    fn unload_reverts_effective_transfer_syntax() {
        let mut request = CStoreRequest::new(
            PathBuf::from("ct.dcm"),
            uids::CT_IMAGE_STORAGE.to_string(),
            "1.2.3.4".to_string(),
            uids::EXPLICIT_VR_LITTLE_ENDIAN.to_string(),
            None,
        );
        request.effective_transfer_syntax = uids::IMPLICIT_VR_LITTLE_ENDIAN.to_string();
        request.loaded = true;

        unload(&mut request);
        assert!(!request.is_loaded());
        assert!(request.dataset.is_none());
        assert_eq!(
            request.effective_transfer_syntax(),
            uids::EXPLICIT_VR_LITTLE_ENDIAN
        );
    }
}
