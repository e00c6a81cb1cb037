//! Loopback tests for association negotiation and data transfer.
use std::io::{Read, Write};
use std::net::SocketAddr;
use std::time::Duration;

use courier_ul::association::{Association, SessionState};
use courier_ul::pdu::{PDataValue, PDataValueType, Pdu, PresentationContextResultReason};
use courier_ul::{ClientAssociationOptions, ServerAssociationOptions};

type Result<T> = std::result::Result<T, Box<dyn std::error::Error + Send + Sync + 'static>>;

static SCU_AE_TITLE: &str = "STORE-SCU";
static SCP_AE_TITLE: &str = "STORE-SCP";

static IMPLICIT_VR_LE: &str = "1.2.840.10008.1.2";
static EXPLICIT_VR_LE: &str = "1.2.840.10008.1.2.1";
// raw UID with even padding, as providable by DICOM objects
static MR_IMAGE_STORAGE_RAW: &str = "1.2.840.10008.5.1.4.1.1.4\0";
static MR_IMAGE_STORAGE: &str = "1.2.840.10008.5.1.4.1.1.4";
static CT_IMAGE_STORAGE: &str = "1.2.840.10008.5.1.4.1.1.2";

fn spawn_scp() -> Result<(std::thread::JoinHandle<Result<()>>, SocketAddr)> {
    let listener = std::net::TcpListener::bind("localhost:0")?;
    let addr = listener.local_addr()?;
    let scp = ServerAssociationOptions::new()
        .accept_called_ae_title()
        .ae_title(SCP_AE_TITLE)
        .with_abstract_syntax(MR_IMAGE_STORAGE)
        .with_abstract_syntax(CT_IMAGE_STORAGE)
        .with_transfer_syntax(IMPLICIT_VR_LE)
        .with_transfer_syntax(EXPLICIT_VR_LE);

    let h = std::thread::spawn(move || -> Result<()> {
        let (stream, _addr) = listener.accept()?;
        let mut association = scp.establish(stream)?;

        assert_eq!(association.client_ae_title(), SCU_AE_TITLE);

        let accepted: Vec<_> = association
            .presentation_contexts()
            .iter()
            .filter(|pc| pc.reason == PresentationContextResultReason::Acceptance)
            .collect();
        assert_eq!(accepted.len(), 2);
        assert_eq!(accepted[0].abstract_syntax, MR_IMAGE_STORAGE);

        // handle one release request
        let pdu = association.receive()?;
        assert_eq!(pdu, Pdu::ReleaseRQ);
        association.respond_release()?;

        Ok(())
    });
    Ok((h, addr))
}

/// Run an SCP and an SCU concurrently,
/// negotiate an association and release it.
#[test]
fn scu_scp_association_and_release() {
    let (scp_handle, scp_addr) = spawn_scp().unwrap();

    let association = ClientAssociationOptions::new()
        .calling_ae_title(SCU_AE_TITLE)
        .called_ae_title(SCP_AE_TITLE)
        .with_presentation_context(MR_IMAGE_STORAGE_RAW, vec![IMPLICIT_VR_LE])
        .with_presentation_context(CT_IMAGE_STORAGE, vec![EXPLICIT_VR_LE, IMPLICIT_VR_LE])
        .establish(scp_addr)
        .unwrap();

    assert_eq!(association.state(), SessionState::Established);
    for pc in association.presentation_contexts() {
        match pc.id {
            1 => {
                assert_eq!(pc.abstract_syntax, MR_IMAGE_STORAGE);
                assert_eq!(pc.transfer_syntax, IMPLICIT_VR_LE);
            }
            3 => {
                assert_eq!(pc.abstract_syntax, CT_IMAGE_STORAGE);
                assert_eq!(pc.transfer_syntax, EXPLICIT_VR_LE);
            }
            id => panic!("unexpected presentation context ID {}", id),
        }
    }

    association
        .release()
        .expect("did not have a peaceful release");

    scp_handle
        .join()
        .expect("SCP panicked")
        .expect("Error at the SCP");
}

/// The SCP rejects the association
/// when the called AE title does not match.
#[test]
fn scu_scp_association_rejected() {
    let listener = std::net::TcpListener::bind("localhost:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let scp = ServerAssociationOptions::new()
        .accept_called_ae_title()
        .ae_title(SCP_AE_TITLE)
        .with_abstract_syntax(MR_IMAGE_STORAGE);

    let scp_handle = std::thread::spawn(move || {
        let (stream, _addr) = listener.accept().unwrap();
        // establishment fails on the acceptor side as well
        assert!(scp.establish(stream).is_err());
    });

    let res = ClientAssociationOptions::new()
        .calling_ae_title(SCU_AE_TITLE)
        .called_ae_title("NOT-THE-SCP")
        .with_abstract_syntax(MR_IMAGE_STORAGE)
        .establish(addr);

    match res {
        Err(courier_ul::association::Error::Rejected { .. }) => {}
        Err(e) => panic!("expected association rejection, got {:?}", e),
        Ok(_) => panic!("expected association rejection, got established association"),
    }

    scp_handle.join().expect("SCP panicked");
}

/// Command and data set bytes travel through P-Data PDUs
/// and are reassembled on the other side.
#[test]
fn scu_scp_pdata_transfer() {
    let listener = std::net::TcpListener::bind("localhost:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let scp = ServerAssociationOptions::new()
        .accept_any()
        .with_abstract_syntax(CT_IMAGE_STORAGE)
        .with_transfer_syntax(EXPLICIT_VR_LE)
        // keep PDUs small to force fragmentation
        .max_pdu_length(4096);

    let payload: Vec<u8> = (0..20_000u32).map(|x| x as u8).collect();
    let expected = payload.clone();

    let scp_handle = std::thread::spawn(move || -> Result<Vec<u8>> {
        let (stream, _addr) = listener.accept().unwrap();
        let mut association = scp.establish(stream)?;

        // first a command PData
        let pdu = association.receive()?;
        match pdu {
            Pdu::PData { data } => {
                assert_eq!(data.len(), 1);
                assert_eq!(data[0].value_type, PDataValueType::Command);
                assert!(data[0].is_last);
                assert_eq!(data[0].data, vec![0x55; 10]);
            }
            pdu => panic!("expected PData, got {:?}", pdu),
        }

        // then the fragmented data set
        let mut dataset = Vec::new();
        association.receive_pdata().read_to_end(&mut dataset)?;

        // answer the release request
        let pdu = association.receive()?;
        assert_eq!(pdu, Pdu::ReleaseRQ);
        association.respond_release()?;
        Ok(dataset)
    });

    let mut association = ClientAssociationOptions::new()
        .calling_ae_title(SCU_AE_TITLE)
        .with_presentation_context(CT_IMAGE_STORAGE, vec![EXPLICIT_VR_LE])
        .establish(addr)
        .unwrap();

    let pc_id = association.presentation_contexts()[0].id;

    association
        .send(&Pdu::PData {
            data: vec![PDataValue {
                presentation_context_id: pc_id,
                value_type: PDataValueType::Command,
                is_last: true,
                data: vec![0x55; 10],
            }],
        })
        .unwrap();

    {
        let mut pdata = association.send_pdata(pc_id);
        pdata.write_all(&payload).unwrap();
        pdata.finish().unwrap();
    }

    association.release().unwrap();

    let received = scp_handle
        .join()
        .expect("SCP panicked")
        .expect("Error at the SCP");
    assert_eq!(received, expected);
}

/// An idle peer trips the DIMSE timeout
/// and the session is closed on error.
#[test]
fn dimse_timeout_closes_session() {
    let listener = std::net::TcpListener::bind("localhost:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let scp = ServerAssociationOptions::new()
        .accept_any()
        .with_abstract_syntax(MR_IMAGE_STORAGE);

    let scp_handle = std::thread::spawn(move || {
        let (stream, _addr) = listener.accept().unwrap();
        let mut association = scp.establish(stream).unwrap();
        // stay quiet; the client should give up on its own
        let _ = association.receive();
    });

    let mut association = ClientAssociationOptions::new()
        .calling_ae_title(SCU_AE_TITLE)
        .with_abstract_syntax(MR_IMAGE_STORAGE)
        .dimse_timeout(Duration::from_millis(300))
        .establish(addr)
        .unwrap();

    match association.receive() {
        Err(courier_ul::association::Error::DimseTimeout { .. }) => {}
        other => panic!("expected DIMSE timeout, got {:?}", other.map(|_| ())),
    }
    assert_eq!(association.state(), SessionState::Closed);
    assert!(association.closed_on_error());

    scp_handle.join().expect("SCP panicked");
}
