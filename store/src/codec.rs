//! The capability expected from pixel data codec collaborators.
//!
//! Transcoding a data set between transfer syntaxes is delegated
//! to registered codec adapters;
//! this module only names the interface the store layer needs
//! and provides [`RegistryCodec`],
//! an implementation backed by the main transfer syntax registry.
use byteordered::byteorder::{BigEndian, ReadBytesExt};
use std::io::{Cursor, Seek, SeekFrom};

use dicom_encoding::transfer_syntax::TransferSyntaxIndex;
use dicom_object::DefaultDicomObject;
use dicom_transfer_syntax_registry::TransferSyntaxRegistry;

use crate::{CodecSnafu, Error, Result};

/// Parameters applied when encoding pixel data into a target
/// transfer syntax.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CodecParams {
    /// Quality from 0 to 100, for lossy encoders
    pub quality: Option<u8>,
    /// Encoding effort from 0 to 100
    pub effort: Option<u8>,
}

/// The interface which the store layer expects
/// from a pixel data codec collaborator.
///
/// The unit of work is a whole decoded data set object:
/// [`decode`](Self::decode) re-encodes it into its native,
/// uncompressed form,
/// and [`encode`](Self::encode) compresses it into a target
/// transfer syntax.
pub trait PixelDataCodec: Send + Sync {
    /// Whether a codec is registered
    /// for the given transfer syntax.
    fn has_codec(&self, transfer_syntax: &str) -> bool;

    /// Decompress the object's pixel data,
    /// leaving the data set in Explicit VR Little Endian.
    fn decode(&self, obj: &mut DefaultDicomObject) -> Result<()>;

    /// Compress the object's pixel data
    /// into the given target transfer syntax.
    fn encode(
        &self,
        obj: &mut DefaultDicomObject,
        target_ts: &str,
        params: Option<&CodecParams>,
    ) -> Result<()>;

    /// Scan an encapsulated JPEG pixel data fragment
    /// for the sample precision declared in its SOF marker.
    fn scan_precision(&self, fragment: &[u8]) -> Result<u16> {
        scan_jpeg_bit_depth(fragment)
    }
}

/// A pixel data codec backed by the adapters
/// in the main transfer syntax registry.
#[derive(Debug, Default, Copy, Clone)]
pub struct RegistryCodec;

impl PixelDataCodec for RegistryCodec {
    fn has_codec(&self, transfer_syntax: &str) -> bool {
        TransferSyntaxRegistry
            .get(transfer_syntax)
            .map(|ts| !ts.is_unsupported())
            .unwrap_or(false)
    }

    fn decode(&self, obj: &mut DefaultDicomObject) -> Result<()> {
        registry_decode(obj)
    }

    fn encode(
        &self,
        obj: &mut DefaultDicomObject,
        target_ts: &str,
        params: Option<&CodecParams>,
    ) -> Result<()> {
        registry_encode(obj, target_ts, params)
    }
}

#[cfg(feature = "transcode")]
fn registry_decode(obj: &mut DefaultDicomObject) -> Result<()> {
    use dicom_pixeldata::Transcode;
    let ts = TransferSyntaxRegistry
        .get(dicom_dictionary_std::uids::EXPLICIT_VR_LITTLE_ENDIAN)
        .expect("Explicit VR Little Endian is always registered");
    obj.transcode(ts).map_err(|e| Error::CodecError {
        message: e.to_string(),
    })
}

#[cfg(not(feature = "transcode"))]
fn registry_decode(_obj: &mut DefaultDicomObject) -> Result<()> {
    CodecSnafu {
        message: "transcoding support is disabled",
    }
    .fail()
}

#[cfg(feature = "transcode")]
fn registry_encode(
    obj: &mut DefaultDicomObject,
    target_ts: &str,
    params: Option<&CodecParams>,
) -> Result<()> {
    use dicom_encoding::adapters::EncodeOptions;
    use dicom_pixeldata::Transcode;
    let ts = TransferSyntaxRegistry
        .get(target_ts)
        .ok_or_else(|| Error::CodecError {
            message: format!("unknown transfer syntax {}", target_ts),
        })?;
    let mut options = EncodeOptions::new();
    if let Some(params) = params {
        options.quality = params.quality;
        options.effort = params.effort;
    }
    obj.transcode_with_options(ts, options)
        .map_err(|e| Error::CodecError {
            message: e.to_string(),
        })
}

#[cfg(not(feature = "transcode"))]
fn registry_encode(
    _obj: &mut DefaultDicomObject,
    _target_ts: &str,
    _params: Option<&CodecParams>,
) -> Result<()> {
    CodecSnafu {
        message: "transcoding support is disabled",
    }
    .fail()
}

/// Whether a transfer syntax encapsulates its pixel data,
/// requiring a codec step to reach the native form.
///
/// Unknown transfer syntaxes are treated as encapsulated.
pub fn is_encapsulated(transfer_syntax: &str) -> bool {
    TransferSyntaxRegistry
        .get(transfer_syntax)
        .map(|ts| !ts.is_codec_free())
        .unwrap_or(true)
}

/// Scan a JPEG stream for the sample precision
/// declared in its start-of-frame marker.
///
/// Walks the marker segments of the stream,
/// skipping the table, application, and comment segments,
/// until a SOF marker of any JPEG process is found.
/// Fails when the stream is not recognizable as JPEG
/// or holds no SOF marker.
pub fn scan_jpeg_bit_depth(stream: &[u8]) -> Result<u16> {
    let len = stream.len() as u64;
    let mut cursor = Cursor::new(stream);

    fn read_marker(cursor: &mut Cursor<&[u8]>) -> Result<u16> {
        cursor.read_u16::<BigEndian>().map_err(|_| Error::CodecError {
            message: "unable to determine bit depth: truncated JPEG stream".to_string(),
        })
    }

    fn skip_segment(cursor: &mut Cursor<&[u8]>) -> Result<()> {
        let length = read_marker(cursor)?;
        cursor
            .seek(SeekFrom::Current(i64::from(length) - 2))
            .map_err(|_| Error::CodecError {
                message: "unable to determine bit depth: truncated JPEG segment".to_string(),
            })?;
        Ok(())
    }

    while cursor.position() < len {
        let marker = read_marker(&mut cursor)?;
        match marker {
            // SOF markers of the Huffman processes:
            // baseline, extended sequential, progressive, lossless,
            // and their differential (hierarchical) variants
            0xffc0..=0xffc3 | 0xffc5..=0xffc7
            // SOF markers of the arithmetic processes
            | 0xffc9..=0xffcb | 0xffcd..=0xffcf => {
                // skip the segment length, the precision byte follows
                cursor
                    .seek(SeekFrom::Current(2))
                    .map_err(|_| Error::CodecError {
                        message: "unable to determine bit depth: truncated SOF segment"
                            .to_string(),
                    })?;
                let precision = cursor.read_u8().map_err(|_| Error::CodecError {
                    message: "unable to determine bit depth: truncated SOF segment".to_string(),
                })?;
                return Ok(u16::from(precision));
            }
            // reserved for JPEG extensions
            0xffc8 => skip_segment(&mut cursor)?,
            // table definitions
            0xffc4 | 0xffcc => skip_segment(&mut cursor)?,
            // restart markers, SOI and EOI carry no segment
            0xffd0..=0xffd9 => {}
            // SOS, tables, application and comment segments
            0xffda..=0xfffe => skip_segment(&mut cursor)?,
            // temporary private use
            0xff01 => {}
            _ => {
                // tolerate the reserved markers, fail on anything else
                let b1 = marker >> 8;
                let b2 = marker & 0xff;
                if !(b1 == 0xff && b2 > 2 && b2 <= 0xbf) {
                    return CodecSnafu {
                        message: "unable to determine bit depth: JPEG syntax error",
                    }
                    .fail();
                }
            }
        }
    }

    CodecSnafu {
        message: "unable to determine bit depth: no JPEG SOF marker found",
    }
    .fail()
}

#[cfg(test)]
mod tests {
    use super::*;

    /// SOI, APP0 (JFIF stub), SOF0 with 12-bit precision
    fn jpeg_with_precision(precision: u8) -> Vec<u8> {
        let mut stream = vec![
            0xff, 0xd8, // SOI
            0xff, 0xe0, 0x00, 0x04, 0x4a, 0x46, // APP0, length 4
        ];
        // SOF0: length 11, precision, 1x1, 1 component
        stream.extend([
            0xff, 0xc0, 0x00, 0x0b, precision, 0x00, 0x01, 0x00, 0x01, 0x01, 0x01, 0x11, 0x00,
        ]);
        stream
    }

    #[test]
    fn finds_precision_in_sof0() {
        assert_eq!(scan_jpeg_bit_depth(&jpeg_with_precision(8)).unwrap(), 8);
        assert_eq!(scan_jpeg_bit_depth(&jpeg_with_precision(12)).unwrap(), 12);
    }

    #[test]
    fn finds_precision_in_lossless_sof() {
        // SOI followed by SOF3 (lossless, Huffman)
        let stream = vec![
            0xff, 0xd8, // SOI
            0xff, 0xc3, 0x00, 0x0b, 16, 0x00, 0x01, 0x00, 0x01, 0x01, 0x01, 0x11, 0x00,
        ];
        assert_eq!(scan_jpeg_bit_depth(&stream).unwrap(), 16);
    }

    #[test]
    fn rejects_non_jpeg_data() {
        let stream = vec![0x00, 0x01, 0x02, 0x03];
        assert!(scan_jpeg_bit_depth(&stream).is_err());
    }

    #[test]
    fn rejects_stream_without_sof() {
        // SOI then EOI, nothing else
        let stream = vec![0xff, 0xd8, 0xff, 0xd9];
        assert!(scan_jpeg_bit_depth(&stream).is_err());
    }

    #[test]
    fn uncompressed_syntaxes_are_not_encapsulated() {
        assert!(!is_encapsulated("1.2.840.10008.1.2"));
        assert!(!is_encapsulated("1.2.840.10008.1.2.1"));
        assert!(is_encapsulated("1.2.840.10008.1.2.4.70"));
    }
}
