// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Bit-exact wire fixtures: canonical PDU headers captured from an
//! open-iscsi initiator, parsed through the model layer.

use exanodes_lum::models::{
    common::BasicHeaderSegment,
    login::{common::Stage, request::LoginRequest},
    opcode::Opcode,
    parse::Pdu,
};
use hex_literal::hex;

/// Login request: immediate, transit, CSG=Operational, NSG=FullFeature,
/// ISID 00023d000001, ITT 1, CmdSN 1, ExpStatSN 1, DSL 0x71.
const LOGIN_BHS: [u8; 48] = hex!(
    "43 87 00 00 00 00 00 71"
    "00 02 3d 00 00 01 00 00"
    "00 00 00 01 00 00 00 00"
    "00 00 00 01 00 00 00 01"
    "00 00 00 00 00 00 00 00"
    "00 00 00 00 00 00 00 00"
);

#[test]
fn login_request_fixture_parses() {
    let mut bytes = LOGIN_BHS;
    let req = LoginRequest::from_bhs_bytes(&mut bytes).expect("parse");
    assert!(req.opcode.i());
    assert!(req.flags.transit());
    assert_eq!(req.flags.csg(), Some(Stage::Operational));
    assert_eq!(req.flags.nsg(), Some(Stage::FullFeature));
    assert_eq!(req.isid, [0x00, 0x02, 0x3d, 0x00, 0x00, 0x01]);
    assert_eq!(req.tsih.get(), 0);
    assert_eq!(req.initiator_task_tag, 1);
    assert_eq!(req.cmd_sn.get(), 1);
    assert_eq!(req.exp_stat_sn.get(), 1);
    assert_eq!(req.get_data_length_bytes(), 0x71);
}

#[test]
fn pdu_dispatch_recognizes_the_opcode() {
    let mut bytes = LOGIN_BHS;
    let pdu = Pdu::from_bhs_bytes(&mut bytes).expect("parse");
    assert_eq!(pdu.get_opcode().expect("opcode").opcode, Opcode::LoginReq);
    assert_eq!(pdu.total_length_bytes(), 48 + 0x71 + 3); // DSL padded to 4
}

#[test]
fn login_text_fixture_splits_into_keys() {
    // the 0x71-byte data segment that travels with the header above
    let text = hex::decode(
        "496e69746961746f724e616d653d69716e2e323030342d30352e636f6d2e736561\
         6e6f6465733a636c69656e740053657373696f6e547970653d4e6f726d616c0054\
         61726765744e616d653d69716e2e323030342d30352e636f6d2e7365616e6f6465\
         733a6578616e6f6465732d636c00",
    )
    .expect("hex");
    let items: Vec<String> = text
        .split(|&b| b == 0)
        .filter(|s| !s.is_empty())
        .map(|s| String::from_utf8_lossy(s).into_owned())
        .collect();
    assert_eq!(items[0], "InitiatorName=iqn.2004-05.com.seanodes:client");
    assert_eq!(items[1], "SessionType=Normal");
    assert!(items[2].starts_with("TargetName=iqn.2004-05.com.seanodes:"));
}

#[test]
fn reject_echo_carries_the_offending_header() {
    use exanodes_lum::models::reject::{
        reject_description::RejectReason, response::RejectPduBuilder,
    };

    let builder = RejectPduBuilder::new(RejectReason::ProtocolError)
        .stat_sn(7)
        .exp_cmd_sn(3)
        .max_cmd_sn(67);
    let mut header = builder.header;
    header.set_data_length_bytes(48);
    let mut bhs = [0u8; 48];
    header.to_bhs_bytes(&mut bhs).expect("bhs");

    assert_eq!(bhs[0] & 0x3F, 0x3F);
    assert_eq!(bhs[2], 0x04); // protocol error
    assert_eq!(&bhs[16..20], &[0xff; 4]);
    assert_eq!(u32::from_be_bytes([bhs[24], bhs[25], bhs[26], bhs[27]]), 7);
}
