// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! In-process target plus a minimal raw-PDU initiator for the protocol
//! tests: sessions run over a duplex pipe instead of TCP, everything else
//! is the real stack.

use std::{sync::Arc, time::Duration};

use anyhow::{Context, Result, bail};
use exanodes_lum::{
    cluster::{algo::PrEngine, comm::LoopbackNet, node::NodeId},
    export::{
        export::Export,
        iqn::Iqn,
        iqn_filter::FilterPolicy,
        lun::Lun,
        uuid::ExaUuid,
    },
    lum::{
        blockdevice::RamVolumeStore,
        executive::{BdevAdapter, LumExecutive},
    },
    models::data::sense_data::SenseData,
    scsi::dispatch::ScsiCore,
    target::{core::TargetCore, session::Session},
};
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};

pub const BUFFER_SIZE: u32 = 262_144;
pub const RECV_TIMEOUT: Duration = Duration::from_secs(5);

pub struct TestTarget {
    pub core: Arc<TargetCore>,
    pub scsi: Arc<ScsiCore>,
    pub executive: Arc<LumExecutive>,
    pub store: Arc<RamVolumeStore>,
    pub target_iqn: Iqn,
}

/// Bring up a full single-node target.
pub fn start_target() -> TestTarget {
    let node = NodeId::new(0);
    let scsi = ScsiCore::new(node, BUFFER_SIZE);

    let net = LoopbackNet::new();
    let (link, inbound) = net.join(node);
    let (engine, handle) = PrEngine::new(scsi.clone(), link, inbound);
    scsi.bind_pr_engine(handle.clone());
    tokio::spawn(engine.run());
    handle.set_membership([node].into_iter().collect());

    let target_iqn =
        Iqn::new("iqn.2004-05.com.seanodes:exanodes-testcl").expect("target IQN");
    let core = TargetCore::new(scsi.clone(), target_iqn.clone(), 64, BUFFER_SIZE);
    scsi.bind_transport(core.clone());

    let store = RamVolumeStore::new();
    let executive = LumExecutive::new(store.clone(), core.clone(), BdevAdapter::new());

    TestTarget {
        core,
        scsi,
        executive,
        store,
        target_iqn,
    }
}

impl TestTarget {
    /// Create a RAM volume and export it as an iSCSI LUN.
    pub fn export_volume(
        &self,
        uuid: ExaUuid,
        lun: u64,
        sector_count: u64,
        policy: FilterPolicy,
        filters: &[(&str, FilterPolicy)],
    ) -> Export {
        self.store.create_volume(uuid, sector_count);
        let mut export =
            Export::new_iscsi(uuid, Lun::new(lun).expect("valid LUN"), policy);
        for (pattern, fpolicy) in filters {
            export
                .add_iqn_filter(Iqn::new(pattern).expect("valid pattern"), *fpolicy)
                .expect("add filter");
        }
        let mut buf = vec![0u8; Export::serialized_size()];
        export.serialize(&mut buf).expect("serialize");
        self.executive.export(&buf).expect("export");
        export
    }

    /// Open a connection: the server side runs a real session task.
    pub fn connect(&self) -> Initiator {
        let (client, server) = tokio::io::duplex(1024 * 1024);
        let (read_half, write_half) = tokio::io::split(server);
        let handle = self
            .core
            .acquire_session(Box::new(write_half))
            .expect("session pool exhausted");
        tokio::spawn(Session::new(self.core.clone(), handle, read_half).run());
        Initiator {
            stream: client,
            cmd_sn: 1,
            exp_stat_sn: 1,
            next_itt: 1,
        }
    }
}

/// What one SCSI command came back with.
#[derive(Debug)]
pub struct ScsiReply {
    pub status: u8,
    pub data: Vec<u8>,
    pub sense: Option<SenseData>,
}

pub const STATUS_GOOD: u8 = 0x00;
pub const STATUS_CHECK_CONDITION: u8 = 0x02;
pub const STATUS_RESERVATION_CONFLICT: u8 = 0x18;

pub struct Initiator {
    pub stream: DuplexStream,
    pub cmd_sn: u32,
    pub exp_stat_sn: u32,
    pub next_itt: u32,
}

fn pad4(n: usize) -> usize {
    (4 - (n % 4)) % 4
}

fn put_u32(buf: &mut [u8], at: usize, v: u32) {
    buf[at..at + 4].copy_from_slice(&v.to_be_bytes());
}

fn put_dsl(buf: &mut [u8], len: usize) {
    let be = (len as u32).to_be_bytes();
    buf[5..8].copy_from_slice(&be[1..4]);
}

fn put_lun(buf: &mut [u8], lun: u64) {
    buf[8..10].copy_from_slice(&(lun as u16).to_be_bytes());
}

fn text_payload(pairs: &[(&str, &str)]) -> Vec<u8> {
    let mut out = Vec::new();
    for (k, v) in pairs {
        out.extend_from_slice(k.as_bytes());
        out.push(b'=');
        out.extend_from_slice(v.as_bytes());
        out.push(0);
    }
    out
}

impl Initiator {
    pub async fn send_pdu(&mut self, header: [u8; 48], data: &[u8]) -> Result<()> {
        self.stream.write_all(&header).await?;
        if !data.is_empty() {
            self.stream.write_all(data).await?;
            let pad = pad4(data.len());
            if pad != 0 {
                self.stream.write_all(&[0u8; 3][..pad]).await?;
            }
        }
        self.stream.flush().await?;
        Ok(())
    }

    pub async fn recv_pdu(&mut self) -> Result<([u8; 48], Vec<u8>)> {
        let mut header = [0u8; 48];
        tokio::time::timeout(RECV_TIMEOUT, self.stream.read_exact(&mut header))
            .await
            .context("timed out waiting for a PDU")??;
        let dsl = u32::from_be_bytes([0, header[5], header[6], header[7]]) as usize;
        let mut data = vec![0u8; dsl + pad4(dsl)];
        if !data.is_empty() {
            tokio::time::timeout(RECV_TIMEOUT, self.stream.read_exact(&mut data))
                .await
                .context("timed out reading a PDU tail")??;
        }
        data.truncate(dsl);
        Ok((header, data))
    }

    /// Next response PDU that is not an async message.
    pub async fn recv_solicited(&mut self) -> Result<([u8; 48], Vec<u8>)> {
        loop {
            let (header, data) = self.recv_pdu().await?;
            if header[0] & 0x3F != 0x32 {
                return Ok((header, data));
            }
        }
    }

    fn take_itt(&mut self) -> u32 {
        let itt = self.next_itt;
        self.next_itt += 1;
        itt
    }

    async fn login_with(&mut self, keys: &[(&str, &str)]) -> Result<u16> {
        let payload = text_payload(keys);
        let mut header = [0u8; 48];
        header[0] = 0x40 | 0x03; // immediate login
        header[1] = 0x80 | (1 << 2) | 3; // transit, CSG operational, NSG full feature
        header[8..14].copy_from_slice(&[0, 2, 0x3D, 0, 0, 1]); // ISID
        put_dsl(&mut header, payload.len());
        put_u32(&mut header, 16, self.take_itt());
        put_u32(&mut header, 24, self.cmd_sn);
        put_u32(&mut header, 28, self.exp_stat_sn);

        self.send_pdu(header, &payload).await?;
        let (rsp, _) = self.recv_solicited().await?;
        if rsp[0] & 0x3F != 0x23 {
            bail!("expected Login Response, got opcode {:#04x}", rsp[0]);
        }
        if rsp[36] != 0 {
            bail!("login failed: status class {:#04x}.{:#04x}", rsp[36], rsp[37]);
        }
        self.exp_stat_sn = u32::from_be_bytes([rsp[24], rsp[25], rsp[26], rsp[27]]) + 1;
        Ok(u16::from_be_bytes([rsp[14], rsp[15]]))
    }

    pub async fn login_normal(&mut self, initiator: &str, target: &str) -> Result<u16> {
        self.login_with(&[
            ("InitiatorName", initiator),
            ("SessionType", "Normal"),
            ("TargetName", target),
        ])
        .await
    }

    pub async fn login_discovery(&mut self, initiator: &str) -> Result<u16> {
        self.login_with(&[
            ("InitiatorName", initiator),
            ("SessionType", "Discovery"),
        ])
        .await
    }

    fn scsi_header(
        &mut self,
        lun: u64,
        cdb: &[u8],
        read: bool,
        write: bool,
        edtl: u32,
        imm_len: usize,
    ) -> ([u8; 48], u32) {
        let mut header = [0u8; 48];
        header[0] = 0x01;
        header[1] = 0x80
            | if read { 0x40 } else { 0 }
            | if write { 0x20 } else { 0 }
            | 0x01; // simple task attribute
        put_dsl(&mut header, imm_len);
        put_lun(&mut header, lun);
        let itt = self.take_itt();
        put_u32(&mut header, 16, itt);
        put_u32(&mut header, 20, edtl);
        put_u32(&mut header, 24, self.cmd_sn);
        put_u32(&mut header, 28, self.exp_stat_sn);
        header[32..32 + cdb.len()].copy_from_slice(cdb);
        self.cmd_sn += 1;
        (header, itt)
    }

    /// Issue one data-in (or status-only) SCSI command and collect the
    /// response PDUs into a single reply.
    pub async fn scsi_read(
        &mut self,
        lun: u64,
        cdb: &[u8],
        edtl: u32,
    ) -> Result<ScsiReply> {
        let (header, _) = self.scsi_header(lun, cdb, edtl > 0, false, edtl, 0);
        self.send_pdu(header, &[]).await?;
        self.collect_reply().await
    }

    /// Issue a write with the whole payload as immediate data.
    pub async fn scsi_write_immediate(
        &mut self,
        lun: u64,
        cdb: &[u8],
        payload: &[u8],
    ) -> Result<ScsiReply> {
        let (header, _) =
            self.scsi_header(lun, cdb, false, true, payload.len() as u32, payload.len());
        self.send_pdu(header, payload).await?;
        self.collect_reply().await
    }

    /// Issue a write without immediate data: expect an R2T, answer it with
    /// one Data-Out carrying the payload.
    pub async fn scsi_write_solicited(
        &mut self,
        lun: u64,
        cdb: &[u8],
        payload: &[u8],
    ) -> Result<ScsiReply> {
        let (header, itt) =
            self.scsi_header(lun, cdb, false, true, payload.len() as u32, 0);
        self.send_pdu(header, &[]).await?;

        let (r2t, _) = self.recv_solicited().await?;
        if r2t[0] & 0x3F != 0x31 {
            bail!("expected R2T, got opcode {:#04x}", r2t[0]);
        }
        let ttt = u32::from_be_bytes([r2t[20], r2t[21], r2t[22], r2t[23]]);
        let offset = u32::from_be_bytes([r2t[40], r2t[41], r2t[42], r2t[43]]);
        let desired = u32::from_be_bytes([r2t[44], r2t[45], r2t[46], r2t[47]]);
        assert_eq!(offset, 0);
        assert_eq!(desired as usize, payload.len());

        let mut data_out = [0u8; 48];
        data_out[0] = 0x05;
        data_out[1] = 0x80; // final
        put_dsl(&mut data_out, payload.len());
        put_lun(&mut data_out, lun);
        put_u32(&mut data_out, 16, itt);
        put_u32(&mut data_out, 20, ttt);
        put_u32(&mut data_out, 28, self.exp_stat_sn);
        put_u32(&mut data_out, 40, offset);
        self.send_pdu(data_out, payload).await?;

        self.collect_reply().await
    }

    async fn collect_reply(&mut self) -> Result<ScsiReply> {
        let mut collected = Vec::new();
        loop {
            let (header, data) = self.recv_solicited().await?;
            match header[0] & 0x3F {
                // Data-In: append; the S bit collapses the status in
                0x25 => {
                    collected.extend_from_slice(&data);
                    if header[1] & 0x01 != 0 {
                        let stat_sn =
                            u32::from_be_bytes([header[24], header[25], header[26], header[27]]);
                        self.exp_stat_sn = stat_sn + 1;
                        return Ok(ScsiReply {
                            status: header[3],
                            data: collected,
                            sense: None,
                        });
                    }
                },
                // SCSI Response
                0x21 => {
                    let stat_sn =
                        u32::from_be_bytes([header[24], header[25], header[26], header[27]]);
                    self.exp_stat_sn = stat_sn + 1;
                    let sense = if data.len() > 2 {
                        SenseData::parse(&data[2..]).ok()
                    } else {
                        None
                    };
                    return Ok(ScsiReply {
                        status: header[3],
                        data: collected,
                        sense,
                    });
                },
                other => bail!("unexpected opcode {other:#04x} while waiting for status"),
            }
        }
    }

    /// Task management request; returns the response code.
    pub async fn task_mgmt(
        &mut self,
        function: u8,
        lun: u64,
        ref_tag: u32,
    ) -> Result<u8> {
        let mut header = [0u8; 48];
        header[0] = 0x02;
        header[1] = 0x80 | function;
        put_lun(&mut header, lun);
        put_u32(&mut header, 16, self.take_itt());
        put_u32(&mut header, 20, ref_tag);
        put_u32(&mut header, 24, self.cmd_sn);
        put_u32(&mut header, 28, self.exp_stat_sn);
        put_u32(&mut header, 32, self.cmd_sn); // RefCmdSN
        self.cmd_sn += 1;
        self.send_pdu(header, &[]).await?;

        let (rsp, _) = self.recv_solicited().await?;
        if rsp[0] & 0x3F != 0x22 {
            bail!("expected Task Response, got opcode {:#04x}", rsp[0]);
        }
        Ok(rsp[2])
    }

    /// SendTargets text request; returns the NUL-separated items.
    pub async fn send_targets(&mut self) -> Result<Vec<String>> {
        let payload = text_payload(&[("SendTargets", "All")]);
        let mut header = [0u8; 48];
        header[0] = 0x04;
        header[1] = 0x80; // final
        put_dsl(&mut header, payload.len());
        put_u32(&mut header, 16, self.take_itt());
        put_u32(&mut header, 20, 0xffff_ffff);
        put_u32(&mut header, 24, self.cmd_sn);
        put_u32(&mut header, 28, self.exp_stat_sn);
        self.cmd_sn += 1;
        self.send_pdu(header, &payload).await?;

        let (rsp, data) = self.recv_solicited().await?;
        if rsp[0] & 0x3F != 0x24 {
            bail!("expected Text Response, got opcode {:#04x}", rsp[0]);
        }
        Ok(data
            .split(|&b| b == 0)
            .filter(|s| !s.is_empty())
            .map(|s| String::from_utf8_lossy(s).into_owned())
            .collect())
    }

    pub async fn nop_ping(&mut self, payload: &[u8]) -> Result<Vec<u8>> {
        let mut header = [0u8; 48];
        header[0] = 0x00;
        header[1] = 0x80;
        put_dsl(&mut header, payload.len());
        put_u32(&mut header, 16, self.take_itt());
        put_u32(&mut header, 20, 0xffff_ffff);
        put_u32(&mut header, 24, self.cmd_sn);
        put_u32(&mut header, 28, self.exp_stat_sn);
        self.cmd_sn += 1;
        self.send_pdu(header, payload).await?;

        let (rsp, data) = self.recv_solicited().await?;
        if rsp[0] & 0x3F != 0x20 {
            bail!("expected NOP-In, got opcode {:#04x}", rsp[0]);
        }
        Ok(data)
    }

    pub async fn logout(&mut self) -> Result<u8> {
        let mut header = [0u8; 48];
        header[0] = 0x40 | 0x06;
        header[1] = 0x80; // close session
        put_u32(&mut header, 16, self.take_itt());
        put_u32(&mut header, 24, self.cmd_sn);
        put_u32(&mut header, 28, self.exp_stat_sn);
        self.send_pdu(header, &[]).await?;

        let (rsp, _) = self.recv_solicited().await?;
        if rsp[0] & 0x3F != 0x26 {
            bail!("expected Logout Response, got opcode {:#04x}", rsp[0]);
        }
        Ok(rsp[2])
    }
}

// CDB builders the tests share

pub fn cdb_inquiry(alloc: u16) -> Vec<u8> {
    let mut cdb = vec![0u8; 6];
    cdb[0] = 0x12;
    cdb[3..5].copy_from_slice(&alloc.to_be_bytes());
    cdb
}

pub fn cdb_report_luns(alloc: u32) -> Vec<u8> {
    let mut cdb = vec![0u8; 12];
    cdb[0] = 0xA0;
    cdb[6..10].copy_from_slice(&alloc.to_be_bytes());
    cdb
}

pub fn cdb_read10(lba: u32, blocks: u16) -> Vec<u8> {
    let mut cdb = vec![0u8; 10];
    cdb[0] = 0x28;
    cdb[2..6].copy_from_slice(&lba.to_be_bytes());
    cdb[7..9].copy_from_slice(&blocks.to_be_bytes());
    cdb
}

pub fn cdb_write10(lba: u32, blocks: u16) -> Vec<u8> {
    let mut cdb = vec![0u8; 10];
    cdb[0] = 0x2A;
    cdb[2..6].copy_from_slice(&lba.to_be_bytes());
    cdb[7..9].copy_from_slice(&blocks.to_be_bytes());
    cdb
}

pub fn cdb_read_capacity() -> Vec<u8> {
    let mut cdb = vec![0u8; 10];
    cdb[0] = 0x25;
    cdb
}

pub fn cdb_test_unit_ready() -> Vec<u8> {
    vec![0u8; 6]
}

pub fn parse_reported_luns(data: &[u8]) -> Vec<u64> {
    let len = u32::from_be_bytes([data[0], data[1], data[2], data[3]]) as usize;
    data[8..(8 + len).min(data.len())]
        .chunks(8)
        .map(|c| u16::from_be_bytes([c[0], c[1]]) as u64)
        .collect()
}
