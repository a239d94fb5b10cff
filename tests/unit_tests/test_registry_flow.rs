// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Catalog persistence and the executive's live-export operations.

use anyhow::Result;
use exanodes_lum::{
    errors::LumError,
    export::{
        export::Export, iqn::Iqn, iqn_filter::FilterPolicy, lun::Lun, uuid::ExaUuid,
    },
    registry::{
        table::{AdmExport, ExportTable},
        xml::ExportsFile,
    },
};

use serial_test::serial;

use crate::unit_tests::harness::*;

fn uuid(n: u32) -> ExaUuid {
    ExaUuid([0xBEEF0000 + n, 4, 5, 6])
}

#[test]
#[serial]
fn persist_and_reload_round_trip() {
    let dir = tempfile::tempdir().expect("tempdir");
    let file = ExportsFile::new(dir.path());

    // an empty catalog plus two exports created through the command path:
    // every creation bumps the version and persists
    let mut table = ExportTable::new();

    let mut iscsi = Export::new_iscsi(
        uuid(1),
        Lun::new(3).expect("valid"),
        FilterPolicy::Accept,
    );
    iscsi
        .add_iqn_filter(
            Iqn::new("iqn.2020-01.example:*").expect("valid"),
            FilterPolicy::Reject,
        )
        .expect("filter");
    table.insert(AdmExport::new(iscsi)).expect("insert");
    table.increment_version();
    file.store(&table).expect("store");

    let bdev = Export::new_bdev(uuid(2), "/dev/sda").expect("bdev");
    table.insert(AdmExport::new(bdev)).expect("insert");
    table.increment_version();
    file.store(&table).expect("store");

    assert_eq!(table.version(), 3);

    // process restart: the reloaded catalog matches what was committed
    let mut reloaded = ExportTable::new();
    file.load(&mut reloaded).expect("load");
    assert_eq!(reloaded.version(), 3);
    assert_eq!(reloaded.number(), 2);
    for (a, b) in table.iter().zip(reloaded.iter()) {
        assert!(a.is_equal(b));
    }
}

#[tokio::test]
async fn executive_rejects_double_export_and_reports_info() {
    let tt = start_target();
    let export = tt.export_volume(uuid(3), 5, 1024, FilterPolicy::Accept, &[]);

    let mut buf = vec![0u8; Export::serialized_size()];
    export.serialize(&mut buf).expect("serialize");
    assert_eq!(
        tt.executive.export(&buf),
        Err(LumError::VolumeAlreadyExported)
    );

    let info = tt.executive.get_info(export.uuid()).expect("info");
    assert!(!info.readonly);
    assert!(!info.in_use);
    assert_eq!(tt.executive.exported_uuids(), vec![*export.uuid()]);

    assert_eq!(
        tt.executive.get_info(&uuid(99)),
        Err(LumError::VolumeNotExported)
    );

    tt.executive.unexport(export.uuid()).expect("unexport");
    assert_eq!(
        tt.executive.unexport(export.uuid()),
        Err(LumError::VolumeNotExported)
    );
}

#[tokio::test]
async fn readahead_is_bdev_only() {
    let tt = start_target();
    let export = tt.export_volume(uuid(4), 6, 1024, FilterPolicy::Accept, &[]);
    assert_eq!(
        tt.executive.set_readahead(export.uuid(), 128),
        Err(LumError::ExportWrongMethod)
    );
}

#[tokio::test]
async fn resize_raises_capacity_changed_unit_attention() -> Result<()> {
    let tt = start_target();
    let export = tt.export_volume(uuid(5), 2, 1024, FilterPolicy::Accept, &[]);

    let mut init = tt.connect();
    init.login_normal("iqn.2020-02.example:host1", tt.target_iqn.as_str())
        .await?;

    // growing the volume pushes an async message carrying the unit attention
    tt.executive.resize(export.uuid(), 1024).expect("resize");
    let (header, data) = init.recv_pdu().await?;
    assert_eq!(header[0] & 0x3F, 0x32);
    // sense rides behind a 2-byte length prefix
    let sense = exanodes_lum::models::data::sense_data::SenseData::parse(&data[2..])
        .expect("sense");
    assert_eq!(sense.sense_key, 0x6); // unit attention
    assert_eq!(sense.asc_ascq(), 0x2A09); // capacity data has changed

    // resizing to the same value stays silent; the next PDU is our NOP echo
    tt.executive.resize(export.uuid(), 1024).expect("resize");
    let echoed = init.nop_ping(b"x").await?;
    assert_eq!(echoed, b"x");
    Ok(())
}

#[tokio::test]
async fn filter_update_revokes_access_live() -> Result<()> {
    let tt = start_target();
    let export = tt.export_volume(uuid(6), 4, 1024, FilterPolicy::Accept, &[]);

    let mut init = tt.connect();
    init.login_normal("iqn.2020-01.example:host1", tt.target_iqn.as_str())
        .await?;

    let reply = init.scsi_read(4, &cdb_read10(0, 1), 512).await?;
    assert_eq!(reply.status, STATUS_GOOD);

    // push a description that rejects this initiator
    let mut updated = export.clone();
    updated
        .add_iqn_filter(
            Iqn::new("iqn.2020-01.example:*").expect("valid"),
            FilterPolicy::Reject,
        )
        .expect("filter");
    let mut buf = vec![0u8; Export::serialized_size()];
    updated.serialize(&mut buf).expect("serialize");
    tt.executive.update_iqn_filters(&buf).expect("update");

    // the unit attentions about the changed landscape arrive first
    let (header, _) = init.recv_pdu().await?;
    assert_eq!(header[0] & 0x3F, 0x32);
    let (header, _) = init.recv_pdu().await?;
    assert_eq!(header[0] & 0x3F, 0x32);

    let reply = init.scsi_read(4, &cdb_read10(0, 1), 512).await?;
    assert_eq!(reply.status, STATUS_CHECK_CONDITION);
    Ok(())
}
