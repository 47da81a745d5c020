use lorawan_codec::frame::*;
use lorawan_codec::keys::*;

fn app_key() -> AppKey {
    AppKey::from([
        0x00, 0x11, 0x22, 0x33, 0x44, 0x55, 0x66, 0x77, 0x88, 0x99, 0xaa, 0xbb, 0xcc, 0xdd, 0xee,
        0xff,
    ])
}

fn phy_join_accept_payload() -> Vec<u8> {
    vec![
        0x20, 0x49, 0x3e, 0xeb, 0x51, 0xfb, 0xa2, 0x11, 0x6f, 0x81, 0x0e, 0xdb, 0x37, 0x42, 0x97,
        0x51, 0x42,
    ]
}

fn phy_join_accept_payload_with_c_f_list() -> Vec<u8> {
    vec![
        0x20, 0xe4, 0x56, 0x73, 0xb6, 0x3c, 0xb4, 0xb9, 0xce, 0xcb, 0x2a, 0xa8, 0x3f, 0x03, 0x33,
        0xe6, 0x15, 0xd2, 0xac, 0x89, 0xee, 0xa1, 0x65, 0x98, 0x37, 0xc3, 0xaa, 0x6d, 0xf9, 0x68,
        0x98, 0x89, 0xcf,
    ]
}

fn phy_dataup_payload() -> Vec<u8> {
    vec![
        0x40, 0x04, 0x03, 0x02, 0x01, 0x80, 0x01, 0x00, 0x01, 0xa6, 0x94, 0x64, 0x26, 0x15, 0xd6,
        0xc3, 0xb5, 0x82,
    ]
}

fn phy_datadown_payload() -> Vec<u8> {
    vec![
        0xa0, 0x04, 0x03, 0x02, 0x01, 0x80, 0xff, 0x2a, 0x2a, 0x0a, 0xf1, 0xa3, 0x6a, 0x05, 0xd0,
        0x12, 0x5f, 0x88, 0x5d, 0x88, 0x1d, 0x49, 0xe1,
    ]
}

#[test]
fn mtype_mhdr_round_trip() {
    let examples = [
        (0x00, MType::JoinRequest),
        (0x20, MType::JoinAccept),
        (0x40, MType::UnconfirmedUp),
        (0x60, MType::UnconfirmedDown),
        (0x80, MType::ConfirmedUp),
        (0xa0, MType::ConfirmedDown),
    ];
    for (byte, mtype) in examples {
        assert_eq!(MType::from_mhdr(byte), Some(mtype));
        assert_eq!(mtype.mhdr(), byte);
    }
    // RFU message types, RFU header bits and a non-zero major are rejected
    assert_eq!(MType::from_mhdr(0xc0), None);
    assert_eq!(MType::from_mhdr(0xe0), None);
    assert_eq!(MType::from_mhdr(0x41), None);
    assert_eq!(MType::from_mhdr(0x44), None);
}

// Byte-exact join request reference packet.
#[test]
fn join_request_reference_vector() {
    use aes::cipher::generic_array::GenericArray;
    use cmac::Mac;

    let request = JoinRequest {
        app_eui: "70B3D57ED00201A6".parse().unwrap(),
        dev_eui: "0004A30B001C0530".parse().unwrap(),
        dev_nonce: 0x0001,
    };
    let key: AppKey = "8D7F3B4C5A6B7C8D9E0F1A2B3C4D5E6F".parse().unwrap();
    let packet = request.encode(&key);

    let expected: [u8; 19] = [
        0x00, 0xA6, 0x01, 0x02, 0xD0, 0x7E, 0xD5, 0xB3, 0x70, 0x30, 0x05, 0x1C, 0x00, 0x0B, 0xA3,
        0x04, 0x00, 0x01, 0x00,
    ];
    assert_eq!(packet.len(), 23);
    assert_eq!(&packet[..19], &expected[..]);

    // MIC cross-checked against the cmac crate used directly
    let mut mac = cmac::Cmac::<aes::Aes128>::new(GenericArray::from_slice(key.as_bytes()));
    mac.update(&packet[..19]);
    let reference: [u8; 16] = mac.finalize().into_bytes().into();
    assert_eq!(&packet[19..], &reference[..4]);
}

#[test]
fn join_accept_decrypt_without_cf_list() {
    let accept = JoinAccept::decrypt(&phy_join_accept_payload(), &app_key()).unwrap();
    assert_eq!(accept.cf_list, None);
}

#[test]
fn join_accept_decrypt_with_cf_list() {
    let accept =
        JoinAccept::decrypt(&phy_join_accept_payload_with_c_f_list(), &AppKey::from([1; 16]))
            .unwrap();
    assert_eq!(accept.app_nonce, [3, 2, 1]);
    assert_eq!(accept.rx_delay, 3);
    assert_eq!(accept.rx1_dr_offset, 1);
    assert_eq!(accept.rx2_data_rate, 2);
    assert_eq!(
        accept.cf_list,
        Some([867_100_000, 867_300_000, 867_500_000, 867_700_000, 867_900_000])
    );
}

#[test]
fn join_accept_wrong_key_is_bad_mic() {
    let result = JoinAccept::decrypt(&phy_join_accept_payload(), &AppKey::from([2; 16]));
    assert_eq!(result.err(), Some(DecodeError::BadMic));
}

#[test]
fn join_accept_rejects_bad_sizes() {
    let bytes = phy_join_accept_payload();
    assert_eq!(JoinAccept::decrypt(&bytes[..16], &app_key()).err(), Some(DecodeError::TooShort));
    let mut wrong_mhdr = bytes.clone();
    wrong_mhdr[0] = 0x40;
    assert_eq!(JoinAccept::decrypt(&wrong_mhdr, &app_key()).err(), Some(DecodeError::BadMhdr));
}

#[test]
fn join_accept_encode_decrypt_round_trip() {
    let accept = JoinAccept {
        app_nonce: [0x11, 0x22, 0x33],
        net_id: [0x13, 0x00, 0x00],
        dev_addr: "26011BDA".parse().unwrap(),
        rx1_dr_offset: 1,
        rx2_data_rate: 2,
        rx_delay: 1,
        cf_list: None,
    };
    let encrypted = accept.encode(&app_key());
    assert_eq!(encrypted.len(), 17);
    assert_eq!(JoinAccept::decrypt(&encrypted, &app_key()).unwrap(), accept);

    let with_list = JoinAccept {
        cf_list: Some([867_100_000, 867_300_000, 867_500_000, 867_700_000, 867_900_000]),
        ..accept
    };
    let encrypted = with_list.encode(&app_key());
    assert_eq!(encrypted.len(), 33);
    assert_eq!(JoinAccept::decrypt(&encrypted, &app_key()).unwrap(), with_list);
}

#[test]
fn parse_rejects_short_and_malformed_buffers() {
    assert_eq!(DataFrame::parse(&[0x40; 11]).err(), Some(DecodeError::TooShort));
    // a join accept is not a data frame
    assert_eq!(DataFrame::parse(&phy_join_accept_payload()).err(), Some(DecodeError::BadMhdr));
    // FOptsLen pointing past the end of the buffer
    let bytes = [0x40, 0x04, 0x03, 0x02, 0x01, 0x85, 0x01, 0x00, 0xd6, 0xc3, 0xb5, 0x82];
    assert_eq!(DataFrame::parse(&bytes).err(), Some(DecodeError::TooShort));
}

#[test]
fn parse_data_uplink_reference_vector() {
    let frame = DataFrame::parse(&phy_dataup_payload()).unwrap();
    assert_eq!(frame.mtype, MType::UnconfirmedUp);
    assert_eq!(frame.dev_addr, DevAddr([0x04, 0x03, 0x02, 0x01]));
    assert!(frame.adr);
    assert!(!frame.ack);
    assert!(!frame.adr_ack_req);
    assert_eq!(frame.fcnt, 1);
    assert_eq!(frame.fport, Some(1));
    assert!(frame.fopts.is_empty());
    assert_eq!(frame.mic, Mic([0xd6, 0xc3, 0xb5, 0x82]));

    assert!(frame.verify_mic(&NwkSKey::from([2; 16])));
    assert!(frame.verify(&DevAddr([0x04, 0x03, 0x02, 0x01]), &NwkSKey::from([2; 16])).is_ok());
    assert_eq!(
        frame.verify(&DevAddr([9, 9, 9, 9]), &NwkSKey::from([2; 16])).err(),
        Some(DecodeError::WrongDevAddr)
    );

    let plain = frame.decrypt_payload(&NwkSKey::from([2; 16]), &AppSKey::from([1; 16]));
    assert_eq!(&plain[..], b"hello");
}

#[test]
fn corrupted_payload_fails_mic() {
    let mut bytes = phy_dataup_payload();
    bytes[8] = 0xee;
    let frame = DataFrame::parse(&bytes).unwrap();
    assert!(!frame.verify_mic(&NwkSKey::from([2; 16])));
}

#[test]
fn parse_data_downlink_with_wide_frame_counter() {
    let mut frame = DataFrame::parse(&phy_datadown_payload()).unwrap();
    assert_eq!(frame.mtype, MType::ConfirmedDown);
    assert_eq!(frame.fcnt, 0x2aff);
    assert_eq!(frame.fport, Some(0x2a));

    // the caller supplies the upper counter bits before decrypting
    frame.fcnt = 76_543;
    let plain = frame.decrypt_payload(&NwkSKey::from([2; 16]), &AppSKey::from([1; 16]));
    assert_eq!(&plain[..], b"hello lora");
}

// FRMPayload cipher against a hand-built CTR keystream.
#[test]
fn data_uplink_ctr_round_trip() {
    use aes::cipher::{generic_array::GenericArray, BlockEncrypt, KeyInit};

    let session_key = [0xAA; 16];
    let dev_addr: DevAddr = "26011BDA".parse().unwrap();
    let plain = [0x01, 0x02, 0x03, 0x04];

    let mut frame = DataFrame::uplink(false, dev_addr);
    frame.fcnt = 7;
    frame.fport = Some(1);
    frame.frm_payload.extend_from_slice(&plain).unwrap();
    let packet =
        frame.encode(&NwkSKey::from(session_key), &AppSKey::from(session_key)).unwrap();

    // A-block: 0x01 | 0x00*4 | Dir=0 | DevAddr(LE) | FCnt(LE,4) | 0x00 | Bi=1
    let mut template = [0u8; 16];
    template[0] = 0x01;
    template[6..10].copy_from_slice(dev_addr.as_bytes());
    template[10] = 7;
    template[15] = 0x01;
    let cipher = aes::Aes128::new(GenericArray::from_slice(&session_key));
    let mut keystream = GenericArray::clone_from_slice(&template);
    cipher.encrypt_block(&mut keystream);

    // MHDR(1) DevAddr(4) FCtrl(1) FCnt(2) FPort(1) = 9 bytes of header
    let body = &packet[9..packet.len() - 4];
    for (i, byte) in body.iter().enumerate() {
        assert_eq!(*byte, plain[i] ^ keystream[i]);
    }

    // decoding with the same keys reproduces the plaintext
    let parsed = DataFrame::parse(&packet).unwrap();
    assert!(parsed.verify_mic(&NwkSKey::from(session_key)));
    let decrypted =
        parsed.decrypt_payload(&NwkSKey::from(session_key), &AppSKey::from(session_key));
    assert_eq!(&decrypted[..], &plain[..]);
}

#[test]
fn fopts_ride_in_the_header() {
    let nwk_skey = NwkSKey::from([2; 16]);
    let app_skey = AppSKey::from([1; 16]);

    let mut frame = DataFrame::uplink(false, DevAddr([4, 3, 2, 1]));
    frame.fopts.extend_from_slice(&[0x03, 0x07]).unwrap();
    let packet = frame.encode(&nwk_skey, &app_skey).unwrap();

    // empty FRMPayload: no FPort byte, FOptsLen = 2
    assert_eq!(packet.len(), 1 + 7 + 2 + 4);
    assert_eq!(packet[5] & 0x0f, 2);
    assert_eq!(&packet[8..10], &[0x03, 0x07]);

    let parsed = DataFrame::parse(&packet).unwrap();
    assert_eq!(parsed.fport, None);
    assert_eq!(&parsed.fopts[..], &[0x03, 0x07]);
    assert!(parsed.verify_mic(&nwk_skey));
}

#[test]
fn port_zero_payload_uses_the_network_key() {
    let nwk_skey = NwkSKey::from([2; 16]);
    let app_skey = AppSKey::from([1; 16]);

    let mut frame = DataFrame::uplink(false, DevAddr([4, 3, 2, 1]));
    frame.fcnt = 3;
    frame.fport = Some(0);
    frame.frm_payload.extend_from_slice(&[0x03, 0x07]).unwrap();
    let packet = frame.encode(&nwk_skey, &app_skey).unwrap();

    let parsed = DataFrame::parse(&packet).unwrap();
    assert_eq!(parsed.fport, Some(0));
    // the ciphertext differs from the plaintext commands
    assert_ne!(&parsed.frm_payload[..], &[0x03, 0x07]);
    // and only the network session key recovers them
    let plain = parsed.decrypt_payload(&nwk_skey, &app_skey);
    assert_eq!(&plain[..], &[0x03, 0x07]);
}

#[test]
fn encode_requires_a_port_for_payload() {
    let mut frame = DataFrame::uplink(false, DevAddr([4, 3, 2, 1]));
    frame.frm_payload.extend_from_slice(b"data").unwrap();
    assert_eq!(
        frame.encode(&NwkSKey::from([2; 16]), &AppSKey::from([1; 16])).err(),
        Some(EncodeError::MissingPort)
    );
}

#[test]
fn encode_decode_all_data_variants() {
    let nwk_skey = NwkSKey::from([2; 16]);
    let app_skey = AppSKey::from([1; 16]);

    for confirmed in [false, true] {
        for downlink in [false, true] {
            for payload in [&b""[..], b"x", b"some application payload"] {
                let dev_addr = DevAddr([4, 3, 2, 1]);
                let mut frame = if downlink {
                    DataFrame::downlink(confirmed, dev_addr)
                } else {
                    DataFrame::uplink(confirmed, dev_addr)
                };
                frame.fcnt = 42;
                if !payload.is_empty() {
                    frame.fport = Some(42);
                    frame.frm_payload.extend_from_slice(payload).unwrap();
                }
                let packet = frame.encode(&nwk_skey, &app_skey).unwrap();

                let parsed = DataFrame::parse(&packet).unwrap();
                assert_eq!(parsed.mtype.is_confirmed(), confirmed);
                assert_eq!(parsed.mtype.is_uplink(), !downlink);
                assert!(parsed.verify_mic(&nwk_skey));
                let plain = parsed.decrypt_payload(&nwk_skey, &app_skey);
                assert_eq!(&plain[..], payload);
            }
        }
    }
}
