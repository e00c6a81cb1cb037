//! P-Data fragmentation and reassembly.
use std::{
    collections::VecDeque,
    io::{Read, Write},
};

use bytes::BytesMut;
use tracing::warn;

use crate::pdu::{PDU_HEADER_SIZE, Pdu};

use super::read_pdu_from_wire;

/// A P-Data value writer.
///
/// This exposes an API to iteratively construct and send data messages
/// to another node.
/// Using this as a [standard writer](std::io::Write)
/// will automatically split the incoming bytes
/// into separate PDUs if they do not fit in a single one.
///
/// The writer must be finished (or dropped)
/// for the last fragment to be sent with the last-fragment flag set.
#[must_use]
pub struct PDataWriter<W: Write> {
    buffer: Vec<u8>,
    stream: W,
    max_data_len: u32,
}

impl<W> PDataWriter<W>
where
    W: Write,
{
    /// Construct a new P-Data value writer.
    ///
    /// `max_pdu_length` is the maximum value of the PDU-length property.
    pub(crate) fn new(stream: W, presentation_context_id: u8, max_pdu_length: u32) -> Self {
        let max_data_length = calculate_max_data_len_single(max_pdu_length);
        let mut buffer = Vec::with_capacity((max_data_length + PDU_HEADER_SIZE) as usize);
        // initial buffer set up
        buffer.extend(&[
            // PDU-type + reserved byte
            0x04,
            0x00,
            // full PDU length, unknown at this point
            0xFF,
            0xFF,
            0xFF,
            0xFF,
            // presentation data length, unknown at this point
            0xFF,
            0xFF,
            0xFF,
            0xFF,
            // presentation context id
            presentation_context_id,
            // message control header, unknown at this point
            0xFF,
        ]);

        PDataWriter {
            stream,
            max_data_len: max_data_length,
            buffer,
        }
    }

    /// Declare to have finished sending P-Data fragments,
    /// thus emitting the last P-Data fragment PDU.
    ///
    /// This is also done automatically once the P-Data writer is dropped.
    pub fn finish(mut self) -> std::io::Result<()> {
        self.finish_impl()?;
        Ok(())
    }

    /// Discard whatever is still buffered
    /// and do not emit a final fragment.
    ///
    /// This leaves the data stream incomplete on the peer's side;
    /// the caller is expected to abort the association afterwards.
    pub fn abandon(mut self) {
        self.buffer.clear();
    }

    /// Set up the P-Data PDU header for sending.
    fn setup_pdata_header(&mut self, is_last: bool) {
        let data_len = (self.buffer.len() - 12) as u32;

        // full PDU length (minus PDU type and reserved byte)
        let pdu_len = data_len + 4 + 2;
        self.buffer[2..6].copy_from_slice(&pdu_len.to_be_bytes());

        // presentation data length (data + PCID and control header)
        let pdv_data_len = data_len + 2;
        self.buffer[6..10].copy_from_slice(&pdv_data_len.to_be_bytes());

        // message control header
        self.buffer[11] = if is_last { 0x02 } else { 0x00 };
    }

    fn finish_impl(&mut self) -> std::io::Result<()> {
        if !self.buffer.is_empty() {
            // send last PDU
            self.setup_pdata_header(true);
            self.stream.write_all(&self.buffer[..])?;
            // clear buffer so that subsequent calls to `finish_impl`
            // do not send any more PDUs
            self.buffer.clear();
        }
        Ok(())
    }

    /// Use the current state of the buffer to send a new PDU.
    ///
    /// Pre-condition:
    /// the buffer must hold exactly one PDU's worth of data.
    fn dispatch_pdu(&mut self) -> std::io::Result<()> {
        debug_assert!(self.buffer.len() >= 12);
        self.setup_pdata_header(false);
        self.stream.write_all(&self.buffer)?;

        // back to just the header
        self.buffer.truncate(12);

        Ok(())
    }
}

impl<W> Write for PDataWriter<W>
where
    W: Write,
{
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let total_len = self.max_data_len as usize + 12;
        if self.buffer.len() + buf.len() <= total_len {
            // accumulate into buffer
            self.buffer.extend(buf);
            Ok(buf.len())
        } else {
            // fill in the rest of the buffer, send the PDU,
            // and leave the rest for subsequent writes
            let buf = &buf[..total_len - self.buffer.len()];
            self.buffer.extend(buf);
            debug_assert_eq!(self.buffer.len(), total_len);
            self.dispatch_pdu()?;
            Ok(buf.len())
        }
    }

    fn flush(&mut self) -> std::io::Result<()> {
        // do nothing
        Ok(())
    }
}

/// With the P-Data writer dropped,
/// this `Drop` implementation
/// will construct and emit the last P-Data fragment PDU
/// if there is any data left to send.
impl<W> Drop for PDataWriter<W>
where
    W: Write,
{
    fn drop(&mut self) {
        let _ = self.finish_impl();
    }
}

/// A P-Data value reader.
///
/// This exposes a byte stream of data
/// by iteratively collecting data messages from another node.
/// Using this as a [standard reader](std::io::Read)
/// will provide all incoming data set bytes,
/// even if they reside in separate PDUs,
/// until the fragment marked as last is consumed.
#[must_use]
pub struct PDataReader<'a, R> {
    buffer: VecDeque<u8>,
    stream: R,
    read_buffer: &'a mut BytesMut,
    presentation_context_id: Option<u8>,
    max_data_length: u32,
    last_pdu: bool,
}

impl<'a, R> PDataReader<'a, R>
where
    R: Read,
{
    pub(crate) fn new(stream: R, max_data_length: u32, read_buffer: &'a mut BytesMut) -> Self {
        PDataReader {
            buffer: VecDeque::with_capacity(max_data_length as usize),
            stream,
            read_buffer,
            presentation_context_id: None,
            max_data_length,
            last_pdu: false,
        }
    }

    /// Declare no intention to read more PDUs from the remote node.
    ///
    /// Attempting to read more bytes
    /// will only consume the inner buffer and not result in
    /// more PDUs being received.
    pub fn stop_receiving(&mut self) -> std::io::Result<()> {
        self.last_pdu = true;
        Ok(())
    }
}

impl<R> Read for PDataReader<'_, R>
where
    R: Read,
{
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        if self.buffer.is_empty() {
            if self.last_pdu {
                // reached the end of the P-Data stream
                return Ok(0);
            }

            let pdu =
                read_pdu_from_wire(&mut self.stream, self.read_buffer, self.max_data_length, false)
                    .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?;
            match pdu {
                Pdu::PData { data } => {
                    for pdata_value in data {
                        self.presentation_context_id = match self.presentation_context_id {
                            None => Some(pdata_value.presentation_context_id),
                            Some(cid) if cid == pdata_value.presentation_context_id => Some(cid),
                            Some(cid) => {
                                warn!(
                                    "Received P-Data value of presentation context {}, expected {}",
                                    pdata_value.presentation_context_id, cid
                                );
                                Some(cid)
                            }
                        };
                        self.buffer.extend(pdata_value.data);
                        self.last_pdu = pdata_value.is_last;
                    }
                }
                _ => {
                    return Err(std::io::Error::new(
                        std::io::ErrorKind::UnexpectedEof,
                        "Unexpected PDU type",
                    ))
                }
            }
        }
        Read::read(&mut self.buffer, buf)
    }
}

/// Determine the maximum length of actual PDV data
/// when encapsulated in a PDU with the given length property.
/// Does not account for the first 2 bytes (type + reserved).
#[inline]
fn calculate_max_data_len_single(pdu_len: u32) -> u32 {
    // data length: 4 bytes
    // control header: 2 bytes
    pdu_len - 4 - 2
}

#[cfg(test)]
mod tests {
    use std::io::{Read, Write};

    use bytes::BytesMut;

    use crate::pdu::{
        read_pdu, write_pdu, PDataValue, PDataValueType, Pdu, MINIMUM_PDU_SIZE, PDU_HEADER_SIZE,
    };

    use super::{PDataReader, PDataWriter};

    fn read_all_pdus(buf: &[u8]) -> Vec<Pdu> {
        let mut out = vec![];
        let mut cursor = std::io::Cursor::new(buf);
        while let Some(pdu) = read_pdu(&mut cursor, MINIMUM_PDU_SIZE, true).unwrap() {
            out.push(pdu);
            if cursor.position() == cursor.get_ref().len() as u64 {
                break;
            }
        }
        out
    }

    #[test]
    fn write_pdata_and_finish() {
        let presentation_context_id = 12;

        let mut buf = Vec::new();
        {
            let mut writer = PDataWriter::new(&mut buf, presentation_context_id, MINIMUM_PDU_SIZE);
            writer.write_all(&(0..64).collect::<Vec<u8>>()).unwrap();
            writer.finish().unwrap();
        }

        let pdus = read_all_pdus(&buf);
        assert_eq!(pdus.len(), 1);
        match &pdus[0] {
            Pdu::PData { data } => {
                let data = &data[0];
                assert_eq!(data.value_type, PDataValueType::Data);
                assert_eq!(data.presentation_context_id, presentation_context_id);
                assert!(data.is_last);
                assert_eq!(data.data, (0..64).collect::<Vec<u8>>());
            }
            pdu => panic!("Expected PData, got {:?}", pdu),
        }
    }

    #[test]
    fn write_large_pdata_splits_into_pdus() {
        let presentation_context_id = 32;

        let my_data: Vec<_> = (0..9000_u32).map(|x| x as u8).collect();

        let mut buf = Vec::new();
        {
            let mut writer = PDataWriter::new(&mut buf, presentation_context_id, MINIMUM_PDU_SIZE);
            writer.write_all(&my_data).unwrap();
            writer.finish().unwrap();
        }

        // number of PDUs must be the payload divided by the
        // effective PDU cap, rounded up
        let pdus = read_all_pdus(&buf);
        assert_eq!(pdus.len(), 3);

        let mut all_data: Vec<u8> = Vec::new();
        for (i, pdu) in pdus.iter().enumerate() {
            match pdu {
                Pdu::PData { data } => {
                    assert_eq!(data.len(), 1);
                    let pdv = &data[0];
                    assert_eq!(pdv.value_type, PDataValueType::Data);
                    assert_eq!(pdv.presentation_context_id, presentation_context_id);
                    assert_eq!(pdv.is_last, i == pdus.len() - 1);
                    if !pdv.is_last {
                        assert_eq!(pdv.data.len(), (MINIMUM_PDU_SIZE - PDU_HEADER_SIZE) as usize);
                    }
                    all_data.extend(&pdv.data);
                }
                pdu => panic!("Expected PData, got {:?}", pdu),
            }
        }
        assert_eq!(all_data, my_data);
    }

    #[test]
    fn read_large_pdata_from_multiple_pdus() {
        let presentation_context_id = 32;

        let my_data: Vec<_> = (0..9000_u32).map(|x| x as u8).collect();
        let mut pdu_stream = Vec::new();
        for (i, chunk) in my_data.chunks(3000).enumerate() {
            write_pdu(
                &mut pdu_stream,
                &Pdu::PData {
                    data: vec![PDataValue {
                        value_type: PDataValueType::Data,
                        data: chunk.to_owned(),
                        presentation_context_id,
                        is_last: i == 2,
                    }],
                },
            )
            .unwrap();
        }

        let mut read_buffer = BytesMut::new();
        let mut buf = Vec::new();
        {
            let mut stream = &pdu_stream[..];
            let mut reader = PDataReader::new(&mut stream, MINIMUM_PDU_SIZE, &mut read_buffer);
            reader.read_to_end(&mut buf).unwrap();
        }
        assert_eq!(buf, my_data);
    }
}
