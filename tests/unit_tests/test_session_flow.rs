// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Full-session protocol flows over a duplex pipe: login, discovery,
//! LUN visibility filtering, the read/write paths and task management.

use anyhow::Result;
use exanodes_lum::export::{iqn_filter::FilterPolicy, uuid::ExaUuid};

use crate::unit_tests::harness::*;

fn uuid(n: u32) -> ExaUuid {
    ExaUuid([0xDEAD0000 + n, 1, 2, 3])
}

#[tokio::test]
async fn login_then_logout() -> Result<()> {
    let tt = start_target();
    let mut init = tt.connect();

    let tsih = init
        .login_normal("iqn.2020-02.example:host1", tt.target_iqn.as_str())
        .await?;
    assert_ne!(tsih, 0);

    assert_eq!(init.logout().await?, 0);
    Ok(())
}

#[tokio::test]
async fn login_rejects_wrong_target_name() -> Result<()> {
    let tt = start_target();
    let mut init = tt.connect();
    let err = init
        .login_normal("iqn.2020-02.example:host1", "iqn.2000-01.bogus:other")
        .await
        .expect_err("login must fail");
    assert!(err.to_string().contains("status class"), "{err}");
    Ok(())
}

#[tokio::test]
async fn discovery_send_targets_lists_portals() -> Result<()> {
    let tt = start_target();
    tt.core
        .set_cluster_addresses(&["10.0.0.1".parse()?, "10.0.0.2".parse()?]);
    let mut init = tt.connect();
    init.login_discovery("iqn.2020-02.example:host1").await?;

    let items = init.send_targets().await?;
    assert_eq!(
        items,
        vec![
            format!("TargetName={}", tt.target_iqn),
            "TargetAddress=10.0.0.1:3260,1".to_string(),
            "TargetAddress=10.0.0.2:3260,1".to_string(),
        ]
    );
    Ok(())
}

#[tokio::test]
async fn send_targets_all_rejected_on_normal_session() -> Result<()> {
    let tt = start_target();
    let mut init = tt.connect();
    init.login_normal("iqn.2020-02.example:host1", tt.target_iqn.as_str())
        .await?;

    let items = init.send_targets().await?;
    assert_eq!(items, vec!["SendTargets=Reject".to_string()]);
    Ok(())
}

#[tokio::test]
async fn report_luns_honors_iqn_filters() -> Result<()> {
    let tt = start_target();
    tt.export_volume(
        uuid(1),
        3,
        2048,
        FilterPolicy::Accept,
        &[("iqn.2020-01.example:*", FilterPolicy::Reject)],
    );

    // the filtered-out initiator sees only the well-known LUs
    let mut rejected = tt.connect();
    rejected
        .login_normal("iqn.2020-01.example:host1", tt.target_iqn.as_str())
        .await?;
    let reply = rejected.scsi_read(0, &cdb_report_luns(4096), 4096).await?;
    assert_eq!(reply.status, STATUS_GOOD);
    assert_eq!(parse_reported_luns(&reply.data), vec![0, 1]);

    // anyone else sees the export
    let mut accepted = tt.connect();
    accepted
        .login_normal("iqn.2020-02.example:host1", tt.target_iqn.as_str())
        .await?;
    let reply = accepted.scsi_read(0, &cdb_report_luns(4096), 4096).await?;
    assert_eq!(parse_reported_luns(&reply.data), vec![0, 1, 3]);

    // and the filtered initiator cannot address the LUN either
    let reply = rejected
        .scsi_read(3, &cdb_read10(0, 1), 512)
        .await?;
    assert_eq!(reply.status, STATUS_CHECK_CONDITION);
    let sense = reply.sense.expect("sense data");
    assert_eq!(sense.asc_ascq(), 0x2500); // logical unit not supported

    // admin view: only the authorized nexus is connected to the LUN
    let lun3 = exanodes_lum::export::lun::Lun::new(3)?;
    assert_eq!(
        tt.core
            .nth_connected_iqn(lun3, 0)
            .map(|iqn| iqn.to_string()),
        Some("iqn.2020-02.example:host1".to_string())
    );
    assert!(tt.core.nth_connected_iqn(lun3, 1).is_none());
    Ok(())
}

#[tokio::test]
async fn inquiry_works_without_any_lun() -> Result<()> {
    let tt = start_target();
    let mut init = tt.connect();
    init.login_normal("iqn.2020-02.example:host1", tt.target_iqn.as_str())
        .await?;

    let reply = init.scsi_read(5, &cdb_inquiry(96), 96).await?;
    assert_eq!(reply.status, STATUS_GOOD);
    // free LUN: qualifier "capable", type unknown
    assert_eq!(reply.data[0], 0x3F);
    assert_eq!(&reply.data[8..16], b"SEANODES");
    Ok(())
}

#[tokio::test]
async fn read_path_returns_data_and_bounds_errors() -> Result<()> {
    let tt = start_target();
    tt.export_volume(uuid(2), 3, 2048, FilterPolicy::Accept, &[]);

    let mut init = tt.connect();
    init.login_normal("iqn.2020-02.example:host1", tt.target_iqn.as_str())
        .await?;

    // 8 blocks from LBA 0: 4096 zero bytes, GOOD
    let reply = init.scsi_read(3, &cdb_read10(0, 8), 4096).await?;
    assert_eq!(reply.status, STATUS_GOOD);
    assert_eq!(reply.data.len(), 4096);
    assert!(reply.data.iter().all(|&b| b == 0));

    // reading past the end is an illegal request
    let reply = init.scsi_read(3, &cdb_read10(2040, 16), 8192).await?;
    assert_eq!(reply.status, STATUS_CHECK_CONDITION);
    let sense = reply.sense.expect("sense data");
    assert_eq!(sense.sense_key, 0x5);
    assert_eq!(sense.asc_ascq(), 0x2100); // logical address out of range
    Ok(())
}

#[tokio::test]
async fn immediate_write_then_read_back() -> Result<()> {
    let tt = start_target();
    tt.export_volume(uuid(3), 4, 2048, FilterPolicy::Accept, &[]);

    let mut init = tt.connect();
    init.login_normal("iqn.2020-02.example:host1", tt.target_iqn.as_str())
        .await?;

    let payload: Vec<u8> = (0..4096).map(|i| (i % 251) as u8).collect();
    let reply = init
        .scsi_write_immediate(4, &cdb_write10(16, 8), &payload)
        .await?;
    assert_eq!(reply.status, STATUS_GOOD);

    let reply = init.scsi_read(4, &cdb_read10(16, 8), 4096).await?;
    assert_eq!(reply.status, STATUS_GOOD);
    assert_eq!(reply.data, payload);
    Ok(())
}

#[tokio::test]
async fn solicited_write_goes_through_r2t() -> Result<()> {
    let tt = start_target();
    tt.export_volume(uuid(4), 2, 2048, FilterPolicy::Accept, &[]);

    let mut init = tt.connect();
    init.login_normal("iqn.2020-02.example:host1", tt.target_iqn.as_str())
        .await?;

    let payload: Vec<u8> = (0..2048).map(|i| (i % 13) as u8).collect();
    let reply = init
        .scsi_write_solicited(2, &cdb_write10(0, 4), &payload)
        .await?;
    assert_eq!(reply.status, STATUS_GOOD);

    let reply = init.scsi_read(2, &cdb_read10(0, 4), 2048).await?;
    assert_eq!(reply.data, payload);
    Ok(())
}

#[tokio::test]
async fn read_capacity_reports_last_lba() -> Result<()> {
    let tt = start_target();
    tt.export_volume(uuid(5), 1, 2048, FilterPolicy::Accept, &[]);

    let mut init = tt.connect();
    init.login_normal("iqn.2020-02.example:host1", tt.target_iqn.as_str())
        .await?;

    let reply = init.scsi_read(1, &cdb_read_capacity(), 8).await?;
    assert_eq!(reply.status, STATUS_GOOD);
    let last = u32::from_be_bytes([reply.data[0], reply.data[1], reply.data[2], reply.data[3]]);
    let block = u32::from_be_bytes([reply.data[4], reply.data[5], reply.data[6], reply.data[7]]);
    assert_eq!(last, 2047);
    assert_eq!(block, 512);
    Ok(())
}

#[tokio::test]
async fn reserve6_walls_off_the_other_session() -> Result<()> {
    let tt = start_target();
    tt.export_volume(uuid(6), 7, 2048, FilterPolicy::Accept, &[]);

    let mut holder = tt.connect();
    holder
        .login_normal("iqn.2020-02.example:host1", tt.target_iqn.as_str())
        .await?;
    let mut other = tt.connect();
    other
        .login_normal("iqn.2020-02.example:host2", tt.target_iqn.as_str())
        .await?;

    // RESERVE(6) from the holder
    let mut reserve6 = vec![0u8; 6];
    reserve6[0] = 0x16;
    let reply = holder.scsi_read(7, &reserve6, 0).await?;
    assert_eq!(reply.status, STATUS_GOOD);

    // the other session conflicts on everything, even TEST UNIT READY
    let reply = other.scsi_read(7, &cdb_test_unit_ready(), 0).await?;
    assert_eq!(reply.status, STATUS_RESERVATION_CONFLICT);

    // LU reset clears the SPC-2 reservation
    assert_eq!(other.task_mgmt(5, 7, 0).await?, 0); // FUNCTION COMPLETE
    let reply = other.scsi_read(7, &cdb_test_unit_ready(), 0).await?;
    assert_eq!(reply.status, STATUS_GOOD);
    Ok(())
}

#[tokio::test]
async fn persistent_reservation_blocks_writes_from_others() -> Result<()> {
    let tt = start_target();
    tt.export_volume(uuid(7), 9, 2048, FilterPolicy::Accept, &[]);

    let mut s1 = tt.connect();
    s1.login_normal("iqn.2020-02.example:host1", tt.target_iqn.as_str())
        .await?;
    let mut s2 = tt.connect();
    s2.login_normal("iqn.2020-02.example:host2", tt.target_iqn.as_str())
        .await?;

    // both register, S1 takes a write-exclusive reservation
    let mut register = vec![0u8; 10];
    register[0] = 0x5F;
    register[1] = 0x00; // REGISTER
    let mut params = vec![0u8; 24];
    params[8..16].copy_from_slice(&0xAAu64.to_be_bytes());
    let reply = s1.scsi_write_immediate(9, &register, &params).await?;
    assert_eq!(reply.status, STATUS_GOOD);

    let mut params2 = vec![0u8; 24];
    params2[8..16].copy_from_slice(&0xBBu64.to_be_bytes());
    let reply = s2.scsi_write_immediate(9, &register, &params2).await?;
    assert_eq!(reply.status, STATUS_GOOD);

    let mut reserve = vec![0u8; 10];
    reserve[0] = 0x5F;
    reserve[1] = 0x01; // RESERVE
    reserve[2] = 0x01; // write exclusive
    let mut params = vec![0u8; 24];
    params[0..8].copy_from_slice(&0xAAu64.to_be_bytes());
    let reply = s1.scsi_write_immediate(9, &reserve, &params).await?;
    assert_eq!(reply.status, STATUS_GOOD);

    // S2 can still read but not write
    let reply = s2.scsi_read(9, &cdb_read10(0, 1), 512).await?;
    assert_eq!(reply.status, STATUS_GOOD);
    let reply = s2
        .scsi_write_immediate(9, &cdb_write10(0, 1), &[0u8; 512])
        .await?;
    assert_eq!(reply.status, STATUS_RESERVATION_CONFLICT);
    Ok(())
}

#[tokio::test]
async fn nop_ping_echoes_payload() -> Result<()> {
    let tt = start_target();
    let mut init = tt.connect();
    init.login_normal("iqn.2020-02.example:host1", tt.target_iqn.as_str())
        .await?;

    let echoed = init.nop_ping(b"ping-payload").await?;
    assert_eq!(echoed, b"ping-payload");
    Ok(())
}

#[tokio::test]
async fn abort_task_for_unknown_tag_is_no_such_task() -> Result<()> {
    let tt = start_target();
    tt.export_volume(uuid(8), 2, 2048, FilterPolicy::Accept, &[]);
    let mut init = tt.connect();
    init.login_normal("iqn.2020-02.example:host1", tt.target_iqn.as_str())
        .await?;

    // ABORT TASK referencing a tag that never existed
    assert_eq!(init.task_mgmt(1, 2, 0x7777).await?, 1); // NO SUCH TASK
    Ok(())
}

#[tokio::test]
async fn command_before_login_kills_connection() -> Result<()> {
    let tt = start_target();
    let mut init = tt.connect();

    // a SCSI command without a login must not be answered
    let mut header = [0u8; 48];
    header[0] = 0x01;
    header[1] = 0x80 | 0x40;
    init.send_pdu(header, &[]).await?;
    assert!(init.recv_pdu().await.is_err());
    Ok(())
}

#[tokio::test]
async fn mode_sense_reports_caching_page() -> Result<()> {
    let tt = start_target();
    tt.export_volume(uuid(9), 6, 2048, FilterPolicy::Accept, &[]);
    let mut init = tt.connect();
    init.login_normal("iqn.2020-02.example:host1", tt.target_iqn.as_str())
        .await?;

    let mut cdb = vec![0u8; 6];
    cdb[0] = 0x1A;
    cdb[2] = 0x3F; // all pages
    cdb[4] = 255;
    let reply = init.scsi_read(6, &cdb, 255).await?;
    assert_eq!(reply.status, STATUS_GOOD);
    assert_eq!(reply.data[0] as usize, reply.data.len() - 1);
    Ok(())
}
