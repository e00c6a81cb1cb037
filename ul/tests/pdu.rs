//! Round-trip tests for the seven upper layer PDU types.
use std::io::Cursor;

use courier_ul::pdu::{
    read_pdu, write_pdu, AbortRQServiceProviderReason, AbortRQSource, AssociationAC,
    AssociationRJ, AssociationRJResult, AssociationRJServiceUserReason, AssociationRJSource,
    AssociationRQ, PDataValue, PDataValueType, Pdu, PresentationContextProposed,
    PresentationContextResult, PresentationContextResultReason, UserIdentity, UserIdentityType,
    UserVariableItem, DEFAULT_MAX_PDU, MAXIMUM_PDU_SIZE, MINIMUM_PDU_SIZE,
};

fn roundtrip(pdu: Pdu) {
    let mut bytes = Vec::new();
    write_pdu(&mut bytes, &pdu).expect("failed to write PDU");

    let mut cursor = Cursor::new(&bytes[..]);
    let same_pdu = read_pdu(&mut cursor, DEFAULT_MAX_PDU, true)
        .expect("failed to read PDU")
        .expect("PDU should be complete");

    assert_eq!(same_pdu, pdu);
    assert_eq!(cursor.position(), bytes.len() as u64, "trailing bytes left");
}

#[test]
fn roundtrip_association_rq() {
    roundtrip(Pdu::AssociationRQ(AssociationRQ {
        protocol_version: 1,
        calling_ae_title: "CALLING-AE".to_string(),
        called_ae_title: "CALLED-AE".to_string(),
        application_context_name: "1.2.840.10008.3.1.1.1".to_string(),
        presentation_contexts: vec![
            PresentationContextProposed {
                id: 1,
                abstract_syntax: "1.2.840.10008.5.1.4.1.1.2".to_string(),
                transfer_syntaxes: vec![
                    "1.2.840.10008.1.2.1".to_string(),
                    "1.2.840.10008.1.2".to_string(),
                ],
            },
            PresentationContextProposed {
                id: 3,
                abstract_syntax: "1.2.840.10008.1.1".to_string(),
                transfer_syntaxes: vec!["1.2.840.10008.1.2".to_string()],
            },
        ],
        user_variables: vec![
            UserVariableItem::MaxLength(16_384),
            UserVariableItem::ImplementationClassUID("2.25.1234567".to_string()),
            UserVariableItem::ImplementationVersionName("COURIER-0.1".to_string()),
        ],
    }));
}

#[test]
fn roundtrip_association_rq_with_user_identity() {
    roundtrip(Pdu::AssociationRQ(AssociationRQ {
        protocol_version: 1,
        calling_ae_title: "CALLING-AE".to_string(),
        called_ae_title: "CALLED-AE".to_string(),
        application_context_name: "1.2.840.10008.3.1.1.1".to_string(),
        presentation_contexts: vec![PresentationContextProposed {
            id: 1,
            abstract_syntax: "1.2.840.10008.1.1".to_string(),
            transfer_syntaxes: vec!["1.2.840.10008.1.2".to_string()],
        }],
        user_variables: vec![
            UserVariableItem::MaxLength(32_768),
            UserVariableItem::UserIdentityItem(UserIdentity::new(
                false,
                UserIdentityType::UsernamePassword,
                b"worklist".to_vec(),
                b"secret".to_vec(),
            )),
        ],
    }));
}

#[test]
fn roundtrip_association_ac() {
    roundtrip(Pdu::AssociationAC(AssociationAC {
        protocol_version: 1,
        calling_ae_title: "CALLING-AE".to_string(),
        called_ae_title: "CALLED-AE".to_string(),
        application_context_name: "1.2.840.10008.3.1.1.1".to_string(),
        presentation_contexts: vec![
            PresentationContextResult {
                id: 1,
                reason: PresentationContextResultReason::Acceptance,
                transfer_syntax: "1.2.840.10008.1.2.1".to_string(),
            },
            PresentationContextResult {
                id: 3,
                reason: PresentationContextResultReason::AbstractSyntaxNotSupported,
                transfer_syntax: "1.2.840.10008.1.2".to_string(),
            },
        ],
        user_variables: vec![
            UserVariableItem::MaxLength(0),
            UserVariableItem::ImplementationClassUID("2.25.7654321".to_string()),
        ],
    }));
}

#[test]
fn roundtrip_association_rj() {
    roundtrip(Pdu::AssociationRJ(AssociationRJ {
        result: AssociationRJResult::Permanent,
        source: AssociationRJSource::ServiceUser(
            AssociationRJServiceUserReason::CalledAETitleNotRecognized,
        ),
    }));
    roundtrip(Pdu::AssociationRJ(AssociationRJ {
        result: AssociationRJResult::Transient,
        source: AssociationRJSource::ServiceProviderPresentation(
            courier_ul::pdu::AssociationRJServiceProviderPresentationReason::LocalLimitExceeded,
        ),
    }));
}

#[test]
fn roundtrip_pdata() {
    roundtrip(Pdu::PData {
        data: vec![
            PDataValue {
                presentation_context_id: 1,
                value_type: PDataValueType::Command,
                is_last: true,
                data: vec![0x08, 0x00, 0x00, 0x00, 0x55, 0x4c, 0x04, 0x00],
            },
            PDataValue {
                presentation_context_id: 1,
                value_type: PDataValueType::Data,
                is_last: false,
                data: (0..255).collect(),
            },
        ],
    });
}

#[test]
fn roundtrip_release_and_abort() {
    roundtrip(Pdu::ReleaseRQ);
    roundtrip(Pdu::ReleaseRP);
    roundtrip(Pdu::AbortRQ {
        source: AbortRQSource::ServiceUser,
    });
    roundtrip(Pdu::AbortRQ {
        source: AbortRQSource::ServiceProvider(AbortRQServiceProviderReason::UnexpectedPdu),
    });
}

#[test]
fn incomplete_pdu_reads_as_none() {
    let pdu = Pdu::PData {
        data: vec![PDataValue {
            presentation_context_id: 5,
            value_type: PDataValueType::Data,
            is_last: true,
            data: vec![0; 1024],
        }],
    };
    let mut bytes = Vec::new();
    write_pdu(&mut bytes, &pdu).unwrap();

    // any strict prefix of the encoding is not yet a PDU
    for cut in [0, 1, 5, 6, 100, bytes.len() - 1] {
        let mut cursor = Cursor::new(&bytes[..cut]);
        assert!(
            read_pdu(&mut cursor, DEFAULT_MAX_PDU, true).unwrap().is_none(),
            "prefix of {} bytes should be incomplete",
            cut
        );
    }
}

#[test]
fn strict_mode_rejects_oversized_pdus() {
    let pdu = Pdu::PData {
        data: vec![PDataValue {
            presentation_context_id: 1,
            value_type: PDataValueType::Data,
            is_last: true,
            data: vec![0; MINIMUM_PDU_SIZE as usize + 1],
        }],
    };
    let mut bytes = Vec::new();
    write_pdu(&mut bytes, &pdu).unwrap();

    let mut cursor = Cursor::new(&bytes[..]);
    assert!(read_pdu(&mut cursor, MINIMUM_PDU_SIZE, true).is_err());

    // non-strict mode tolerates PDUs beyond the negotiated maximum
    let mut cursor = Cursor::new(&bytes[..]);
    let read = read_pdu(&mut cursor, MINIMUM_PDU_SIZE, false).unwrap();
    assert_eq!(read, Some(pdu));
}

#[test]
fn unknown_pdu_type_is_preserved() {
    let pdu = Pdu::Unknown {
        pdu_type: 0x09,
        data: vec![1, 2, 3, 4],
    };
    let mut bytes = Vec::new();
    write_pdu(&mut bytes, &pdu).unwrap();
    let mut cursor = Cursor::new(&bytes[..]);
    let read = read_pdu(&mut cursor, MAXIMUM_PDU_SIZE, true).unwrap();
    assert_eq!(read, Some(pdu));
}
