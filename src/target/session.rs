// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! The per-session PDU loop: login negotiation, command sequencing, data
//! transfer and task management for one initiator connection.

use std::{collections::HashMap, sync::Arc, time::Duration};

use anyhow::{Result, bail};
use tokio::io::AsyncRead;
use tracing::{debug, error, info, trace, warn};

use crate::{
    cfg::enums::SessionType,
    export::{iqn::Iqn, lun::Lun},
    models::{
        command::{
            common::{ResponseCode, ScsiStatus},
            request::ScsiCommandRequest,
            response::ScsiCommandResponseBuilder,
        },
        common::{BasicHeaderSegment, Builder, HEADER_LEN, SendingData},
        data::{request::ScsiDataOut, response::ScsiDataInBuilder},
        data_format::PduResponse,
        login::{
            common::Stage,
            request::LoginRequest,
            response::{ISCSI_VERSION, LoginResponse, LoginResponseBuilder},
            status::{StatusClass, StatusDetail},
        },
        logout::{
            common::{LogoutReason, LogoutStatus},
            request::LogoutRequest,
            response::LogoutResponseBuilder,
        },
        nop::{request::NopOutRequest, response::NopInResponseBuilder},
        opcode::{BhsOpcode, Opcode},
        ready_2_transfer::response::ReadyToTransferBuilder,
        reject::{reject_description::RejectReason, response::RejectPduBuilder},
        task::{
            common::{TaskFunction, TaskResponseCode},
            request::TaskMgmtRequest,
            response::TaskMgmtResponseBuilder,
        },
        text::{request::TextRequest, response::TextResponseBuilder},
    },
    scsi::{
        dispatch::{self, CommandEnv},
        sense::CommandStatus,
    },
    target::{
        connection::{MAX_TEXT_LEN, PduReader},
        core::{SessionHandle, TargetCore},
        params::{ParamList, SessionParams, session_param_list, text_add},
    },
};

/// Target transfer tag used on R2Ts and non-final text responses.
const TTT_IN_PROGRESS: u32 = 0x1234;

/// A write command waiting for the rest of its Data-Out payload.
struct PendingWrite {
    lun_field: u64,
    cdb: [u8; 16],
    expected_len: u32,
    buffer: Vec<u8>,
    received: u32,
    r2t_sent: bool,
    r2t_sn: u32,
}

pub struct Session<R> {
    core: Arc<TargetCore>,
    pub handle: Arc<SessionHandle>,
    reader: PduReader<R>,
    params: ParamList,
    sess_params: SessionParams,
    login_started: bool,
    announced_to_cluster: bool,
    pending_writes: HashMap<u32, PendingWrite>,
    tsih: u16,
}

impl<R: AsyncRead + Unpin> Session<R> {
    pub fn new(core: Arc<TargetCore>, handle: Arc<SessionHandle>, reader: R) -> Self {
        let params = session_param_list(core.buffer_size);
        Session {
            core,
            handle,
            reader: PduReader::new(reader),
            params,
            sess_params: SessionParams::default(),
            login_started: false,
            announced_to_cluster: false,
            pending_writes: HashMap::new(),
            tsih: 0,
        }
    }

    /// Drive the connection until logout, error or EOF, then drain.
    pub async fn run(mut self) {
        let id = self.handle.id;
        loop {
            let header = match self.reader.read_bhs().await {
                Ok(Some(h)) => h,
                Ok(None) => break,
                Err(e) => {
                    warn!("session {id}: read failed: {e}");
                    break;
                },
            };

            let opcode = header[0] & 0x3F;
            match self.execute(header).await {
                Ok(()) => {},
                Err(e) => {
                    warn!("session {id}: {e}");
                    break;
                },
            }
            if opcode == Opcode::LogoutReq as u8 {
                break;
            }
        }

        // all outstanding commands drain before the slot is reused
        while self.handle.pending() > 0 {
            debug!("session {id}: {} commands pending", self.handle.pending());
            tokio::time::sleep(Duration::from_millis(50)).await;
        }

        if self.announced_to_cluster {
            self.core.scsi.del_session(id).await;
        }
        self.handle
            .logged_in
            .store(false, std::sync::atomic::Ordering::SeqCst);
        self.core.release_session(id);
        info!("Connection closed: session {id}");
    }

    async fn execute(&mut self, mut header: [u8; HEADER_LEN]) -> Result<()> {
        let op = BhsOpcode::try_from(header[0]);

        // gate: nothing before login has started; only login/logout before
        // full feature
        let raw_op = header[0] & 0x3F;
        if !self.login_started && raw_op != Opcode::LoginReq as u8 {
            bail!(
                "iSCSI op {raw_op:#04x} attempted before LOGIN PHASE"
            );
        }
        if !self.handle.full_feature.load(std::sync::atomic::Ordering::SeqCst)
            && raw_op != Opcode::LoginReq as u8
            && raw_op != Opcode::LogoutReq as u8
        {
            error!(
                "session {}: iSCSI op {raw_op:#04x} attempted before FULL FEATURE",
                self.handle.id
            );
            self.send_login_reject().await?;
            bail!("command before full feature");
        }

        match op {
            Ok(BhsOpcode { opcode: Opcode::LoginReq, .. }) => {
                self.login_command(&mut header).await
            },
            Ok(BhsOpcode { opcode: Opcode::TextReq, .. }) => {
                self.text_command(&mut header).await
            },
            Ok(BhsOpcode { opcode: Opcode::LogoutReq, .. }) => {
                self.logout_command(&mut header).await
            },
            Ok(BhsOpcode { opcode: Opcode::NopOut, .. }) => {
                self.nop_out(&mut header).await
            },
            Ok(BhsOpcode { opcode: Opcode::ScsiTaskMgmtReq, .. }) => {
                self.task_command(&mut header).await
            },
            Ok(BhsOpcode { opcode: Opcode::ScsiCommandReq, .. }) => {
                self.scsi_command(&mut header).await
            },
            Ok(BhsOpcode { opcode: Opcode::ScsiDataOut, .. }) => {
                self.data_out(&mut header).await
            },
            Ok(BhsOpcode { opcode, .. }) => {
                error!("unexpected opcode {opcode:?} from initiator");
                self.reject(&header, RejectReason::ProtocolError).await
            },
            Err(_) => {
                error!("unknown opcode {:#04x}", header[0] & 0x3F);
                self.reject(&header, RejectReason::ProtocolError).await
            },
        }
    }

    async fn send_login_reject(&self) -> Result<()> {
        let (stat_sn, exp_cmd_sn, max_cmd_sn) = self.handle.stat_sn();
        let builder = LoginResponseBuilder::new([0u8; 6], 0)
            .versions(ISCSI_VERSION, ISCSI_VERSION)
            .status(StatusClass::InitiatorError, StatusDetail::InvalidDuringLogin)
            .stat_sn(stat_sn)
            .exp_cmd_sn(exp_cmd_sn)
            .max_cmd_sn(max_cmd_sn);
        let mut bhs = [0u8; HEADER_LEN];
        builder.header.to_bhs_bytes(&mut bhs)?;
        self.handle.writer.send(&bhs, &[]).await
    }

    async fn reject(&self, offending: &[u8; HEADER_LEN], reason: RejectReason) -> Result<()> {
        error!("Reject iSCSI command with reason: {:#04x}", reason as u8);
        let (stat_sn, exp_cmd_sn, max_cmd_sn) = self.handle.next_stat_sn();
        let builder = RejectPduBuilder::new(reason)
            .stat_sn(stat_sn)
            .exp_cmd_sn(exp_cmd_sn)
            .max_cmd_sn(max_cmd_sn);
        let mut header = builder.header;
        header.set_data_length_bytes(HEADER_LEN as u32);
        let mut bhs = [0u8; HEADER_LEN];
        header.to_bhs_bytes(&mut bhs)?;
        self.handle.writer.send_padded(&bhs, offending).await
    }

    async fn login_command(&mut self, header: &mut [u8; HEADER_LEN]) -> Result<()> {
        let (cmd_sn, exp_stat_sn, itt, isid, csg, nsg, transit, cont, version_ok, tsih_ok, data_len);
        {
            let req = LoginRequest::from_bhs_bytes(header.as_mut_slice())?;
            cmd_sn = req.cmd_sn.get();
            exp_stat_sn = req.exp_stat_sn.get();
            itt = req.initiator_task_tag;
            isid = req.isid;
            csg = req.flags.csg();
            nsg = req.flags.nsg();
            transit = req.flags.transit();
            cont = req.flags.cont();
            version_ok = (req.version_min..=req.version_max).contains(&ISCSI_VERSION);
            tsih_ok = req.tsih.get() == 0;
            data_len = req.get_data_length_bytes();
        }

        let mut status = (StatusClass::Success, StatusDetail::None);
        let mut answers = Vec::new();

        if cont && transit {
            error!("bad login flags: C and T both set");
            status = (StatusClass::InitiatorError, StatusDetail::None);
        } else if !version_ok {
            error!("iSCSI version {ISCSI_VERSION} not supported by initiator");
            status = (StatusClass::InitiatorError, StatusDetail::VersionNotSupported);
        } else if !tsih_ok {
            error!("bad TSIH in login request, expected 0");
            status = (StatusClass::InitiatorError, StatusDetail::None);
        } else if data_len > MAX_TEXT_LEN {
            error!("login text too large: {data_len}");
            status = (StatusClass::InitiatorError, StatusDetail::None);
        } else {
            let tail = self.reader.read_exact_bytes(padded(data_len)).await?;
            match self.params.text_parse(&tail[..data_len]) {
                Ok(out) => answers = out,
                Err(e) => {
                    error!("login negotiation failed: {e}");
                    status = (StatusClass::InitiatorError, StatusDetail::None);
                },
            }

            // the TPGT must ride the first Login Response of the session
            if status.0 == StatusClass::Success && !self.login_started {
                let tpgt = self
                    .params
                    .value("TargetPortalGroupTag")
                    .unwrap_or("1")
                    .to_string();
                text_add(&mut answers, "TargetPortalGroupTag", &tpgt);
            }
            self.login_started = true;
        }

        let mut went_full_feature = false;
        if status.0 == StatusClass::Success
            && transit
            && nsg == Some(Stage::FullFeature)
        {
            // post-conditions of the login sequence
            if self.params.value_is_equal("InitiatorName", "") {
                error!("InitiatorName not specified");
                status = (StatusClass::InitiatorError, StatusDetail::None);
            } else if self.params.value_is_equal("SessionType", "Normal")
                && !self
                    .params
                    .value_is_equal("TargetName", self.core.target_iqn.as_str())
            {
                error!(
                    "bad TargetName {:?} (expected {:?})",
                    self.params.value("TargetName").unwrap_or(""),
                    self.core.target_iqn.as_str()
                );
                status = (StatusClass::InitiatorError, StatusDetail::None);
            } else {
                self.tsih = (self.handle.id + 1) as u16;
                went_full_feature = true;
            }
        }

        // login sequencing seeds ExpCmdSN/StatSN from the request
        self.handle.note_cmd_sn(cmd_sn, exp_stat_sn, false);
        let (stat_sn, exp_cmd_sn, max_cmd_sn) = self.handle.next_stat_sn();

        let mut builder = LoginResponseBuilder::new(isid, self.tsih)
            .transit(transit)
            .csg(csg.unwrap_or(Stage::Security))
            .nsg(nsg.unwrap_or(Stage::Security))
            .initiator_task_tag(itt)
            .stat_sn(stat_sn)
            .exp_cmd_sn(exp_cmd_sn)
            .max_cmd_sn(max_cmd_sn)
            .status(status.0, status.1);
        if status.0 == StatusClass::Success && went_full_feature {
            builder = builder.versions(ISCSI_VERSION, ISCSI_VERSION);
        }
        if status.0 != StatusClass::Success {
            answers.clear();
        }
        let mut bhs = [0u8; HEADER_LEN];
        builder.header.to_bhs_bytes(&mut bhs)?;
        let mut pdu = PduResponse::<LoginResponse>::new_response(bhs);
        pdu.append_data(&answers);
        let (rsp_bhs, body) = pdu.build(MAX_TEXT_LEN)?;
        self.handle.writer.send(&rsp_bhs, &body).await?;

        if status.0 != StatusClass::Success {
            bail!("login failed with status class {:?}", status.0);
        }

        if went_full_feature {
            if self.params.value_is_equal("SessionType", "Discovery") {
                self.params.set_value("MaxConnections", "1")?;
            }
            let initiator =
                Iqn::new(self.params.value("InitiatorName").unwrap_or(""))?;
            info!(
                "iscsi: LOGIN SUCCESSFUL session {} initiator {} type {}",
                self.handle.id,
                initiator,
                self.params.value("SessionType").unwrap_or("Normal"),
            );
            self.handle.set_initiator(initiator);
            self.sess_params = SessionParams::from_list(&self.params);
            self.handle
                .full_feature
                .store(true, std::sync::atomic::Ordering::SeqCst);
            self.handle
                .logged_in
                .store(true, std::sync::atomic::Ordering::SeqCst);
            self.recompute_authorized_luns();

            // the cluster learns about the nexus before it may reserve
            if !self.announced_to_cluster {
                self.core.scsi.new_session(self.handle.id).await;
                self.announced_to_cluster = true;
            }
        }

        Ok(())
    }

    fn recompute_authorized_luns(&self) {
        self.handle.clear_authorized();
        let Some(initiator) = self.handle.initiator() else {
            return;
        };
        if !self.session_type().is_normal() {
            return;
        }
        for v in 0..crate::export::lun::MAX_LUNS {
            let lun = Lun::new(v).expect("in range");
            if let Some(live) = self.core.scsi.luns.export(lun) {
                let allowed = live.policy_for_iqn(&initiator)
                    == crate::export::iqn_filter::FilterPolicy::Accept;
                self.handle.set_authorized(lun, allowed);
            }
        }
    }

    fn session_type(&self) -> SessionType {
        if self.params.value_is_equal("SessionType", "Discovery") {
            SessionType::Discovery
        } else {
            SessionType::Normal
        }
    }

    async fn text_command(&mut self, header: &mut [u8; HEADER_LEN]) -> Result<()> {
        let (cmd_sn, exp_stat_sn, itt, lun_field, final_bit, data_len, immediate);
        {
            let req = TextRequest::from_bhs_bytes(header.as_mut_slice())?;
            cmd_sn = req.cmd_sn.get();
            exp_stat_sn = req.exp_stat_sn.get();
            itt = req.initiator_task_tag;
            lun_field = req.lun.get();
            final_bit = req.get_final_bit();
            data_len = req.get_data_length_bytes();
            immediate = req.immediate();
        }

        self.handle.note_cmd_sn(cmd_sn, exp_stat_sn, !immediate);

        if data_len > MAX_TEXT_LEN {
            bail!("text request too large: {data_len}");
        }
        let tail = self.reader.read_exact_bytes(padded(data_len)).await?;
        let mut answers = self.params.text_parse(&tail[..data_len])?;

        if let Some(offer) = self.params.take_offer("SendTargets") {
            if offer == "All" && !self.session_type().is_discovery() {
                text_add(&mut answers, "SendTargets", "Reject");
            } else {
                text_add(&mut answers, "TargetName", self.core.target_iqn.as_str());
                for addr in self.core.cluster_addresses() {
                    text_add(
                        &mut answers,
                        "TargetAddress",
                        &format!("{addr}:{},1", crate::cfg::config::ISCSI_PORT),
                    );
                }
            }
        }

        if self.handle.full_feature.load(std::sync::atomic::Ordering::SeqCst) {
            self.sess_params = SessionParams::from_list(&self.params);
        }

        let (stat_sn, exp_cmd_sn, max_cmd_sn) = self.handle.next_stat_sn();
        let builder = TextResponseBuilder::new()
            .final_bit(final_bit)
            .lun(lun_field)
            .initiator_task_tag(itt)
            .target_transfer_tag(if final_bit { 0xffff_ffff } else { TTT_IN_PROGRESS })
            .stat_sn(stat_sn)
            .exp_cmd_sn(exp_cmd_sn)
            .max_cmd_sn(max_cmd_sn);
        let mut rsp_header = builder.header;
        rsp_header.set_data_length_bytes(answers.len() as u32);

        let mut bhs = [0u8; HEADER_LEN];
        rsp_header.to_bhs_bytes(&mut bhs)?;
        self.handle.writer.send_padded(&bhs, &answers).await
    }

    async fn logout_command(&mut self, header: &mut [u8; HEADER_LEN]) -> Result<()> {
        let (cmd_sn, exp_stat_sn, itt, reason, immediate);
        {
            let req = LogoutRequest::from_bhs_bytes(header.as_mut_slice())?;
            cmd_sn = req.cmd_sn.get();
            exp_stat_sn = req.exp_stat_sn.get();
            itt = req.initiator_task_tag;
            reason = req.reason();
            immediate = req.immediate();
        }

        self.handle.note_cmd_sn(cmd_sn, exp_stat_sn, !immediate);

        let response = if reason == Some(LogoutReason::RemoveConnectionForRecovery)
            && self.params.value_is_equal("ErrorRecoveryLevel", "0")
        {
            LogoutStatus::RecoveryNotSupported
        } else {
            LogoutStatus::Success
        };

        let (stat_sn, exp_cmd_sn, max_cmd_sn) = self.handle.next_stat_sn_logout();
        let builder = LogoutResponseBuilder::new()
            .response(response)
            .initiator_task_tag(itt)
            .stat_sn(stat_sn)
            .exp_cmd_sn(exp_cmd_sn)
            .max_cmd_sn(max_cmd_sn);
        let mut bhs = [0u8; HEADER_LEN];
        builder.header.to_bhs_bytes(&mut bhs)?;
        self.handle.writer.send(&bhs, &[]).await?;

        trace!("iscsi: LOGOUT SUCCESSFUL session {}", self.handle.id);
        self.handle
            .logged_in
            .store(false, std::sync::atomic::Ordering::SeqCst);
        Ok(())
    }

    async fn nop_out(&mut self, header: &mut [u8; HEADER_LEN]) -> Result<()> {
        let (cmd_sn, exp_stat_sn, itt, lun_field, data_len, wants_reply, immediate);
        {
            let req = NopOutRequest::from_bhs_bytes(header.as_mut_slice())?;
            cmd_sn = req.cmd_sn.get();
            exp_stat_sn = req.exp_stat_sn.get();
            itt = req.initiator_task_tag;
            lun_field = req.lun.get();
            data_len = req.get_data_length_bytes();
            wants_reply = req.wants_reply();
            immediate = req.immediate();
        }

        if data_len > self.sess_params.max_recv_data_segment_length as usize {
            bail!("NOP-Out ping data too large: {data_len}");
        }
        let tail = self.reader.read_exact_bytes(padded(data_len)).await?;
        let ping_data = &tail[..data_len];

        self.handle.note_cmd_sn(cmd_sn, exp_stat_sn, !immediate);

        if !wants_reply {
            return Ok(());
        }

        let (stat_sn, exp_cmd_sn, max_cmd_sn) = self.handle.next_stat_sn();
        let builder = NopInResponseBuilder::new()
            .lun(lun_field)
            .initiator_task_tag(itt)
            .target_transfer_tag(0xffff_ffff)
            .stat_sn(stat_sn)
            .exp_cmd_sn(exp_cmd_sn)
            .max_cmd_sn(max_cmd_sn);
        let mut rsp_header = builder.header;
        rsp_header.set_data_length_bytes(ping_data.len() as u32);

        let mut bhs = [0u8; HEADER_LEN];
        rsp_header.to_bhs_bytes(&mut bhs)?;
        self.handle.writer.send_padded(&bhs, ping_data).await
    }

    async fn task_command(&mut self, header: &mut [u8; HEADER_LEN]) -> Result<()> {
        let (cmd_sn, exp_stat_sn, itt, ref_tag, ref_cmd_sn, lun_field, function, immediate);
        {
            let req = TaskMgmtRequest::from_bhs_bytes(header.as_mut_slice())?;
            cmd_sn = req.cmd_sn.get();
            exp_stat_sn = req.exp_stat_sn.get();
            itt = req.initiator_task_tag;
            ref_tag = req.referenced_task_tag.get();
            ref_cmd_sn = req.ref_cmd_sn.get();
            lun_field = req.lun.get();
            function = req.function();
            immediate = req.immediate();
        }

        let lun = Lun::from_bhs_field(lun_field).ok();
        let mut response = TaskResponseCode::FunctionComplete;

        match function {
            Some(TaskFunction::AbortTask) => {
                info!(
                    "Initiator sent ABORT TASK lun {lun:?} tag {itt:#x} ref tag {ref_tag:#x} nexus {}",
                    self.handle.id
                );
                // rfc3720 10.6.1 a) b) c): wait for the referenced command
                // to finish naturally
                let found = match lun {
                    Some(lun) => self.wait_for_tag(lun, ref_tag).await,
                    None => false,
                };
                if !found {
                    let (_, exp_cmd_sn, _) = self.handle.stat_sn();
                    if exp_cmd_sn >= ref_cmd_sn {
                        response = TaskResponseCode::NoSuchTask;
                    }
                }
            },
            Some(TaskFunction::LogicalUnitReset) => {
                info!(
                    "Initiator sent LOGICAL UNIT RESET lun {lun:?} nexus {}",
                    self.handle.id
                );
                match lun {
                    Some(lun) => {
                        self.core.scsi.logical_unit_reset(Some(lun)).await;
                    },
                    None => response = TaskResponseCode::NoSuchLun,
                }
            },
            Some(TaskFunction::TargetWarmReset)
            | Some(TaskFunction::TargetColdReset) => {
                info!("Initiator sent TARGET RESET nexus {}", self.handle.id);
                self.core.scsi.logical_unit_reset(None).await;
            },
            Some(TaskFunction::ClearTaskSet) => {
                info!(
                    "Initiator sent CLEAR TASK SET lun {lun:?} nexus {}",
                    self.handle.id
                );
            },
            Some(
                TaskFunction::AbortTaskSet
                | TaskFunction::ClearAca
                | TaskFunction::TaskReassign,
            ) => {
                response = TaskResponseCode::NoSupport;
            },
            None => {
                error!("Initiator sent unknown task function, nexus {}", self.handle.id);
                response = TaskResponseCode::NoSupport;
            },
        }

        // immediate task commands carry the current CmdSN without advancing
        self.handle.note_cmd_sn(cmd_sn, exp_stat_sn, !immediate);

        let (stat_sn, exp_cmd_sn, max_cmd_sn) = if immediate {
            self.handle.stat_sn()
        } else {
            self.handle.next_stat_sn()
        };
        let builder = TaskMgmtResponseBuilder::new()
            .response(response)
            .initiator_task_tag(itt)
            .stat_sn(stat_sn)
            .exp_cmd_sn(exp_cmd_sn)
            .max_cmd_sn(max_cmd_sn);
        let mut bhs = [0u8; HEADER_LEN];
        builder.header.to_bhs_bytes(&mut bhs)?;
        self.handle.writer.send(&bhs, &[]).await
    }

    async fn wait_for_tag(&self, lun: Lun, tag: u32) -> bool {
        if self.core.scsi.luns.command_by_tag(lun, tag).is_none() {
            return false;
        }
        while self.core.scsi.luns.command_by_tag(lun, tag).is_some() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        true
    }

    async fn scsi_command(&mut self, header: &mut [u8; HEADER_LEN]) -> Result<()> {
        let (cmd_sn, exp_stat_sn, itt, lun_field, cdb, edtl, is_write, data_len, immediate, ahs_len);
        {
            let req = ScsiCommandRequest::from_bhs_bytes(header.as_mut_slice())?;
            cmd_sn = req.cmd_sn.get();
            exp_stat_sn = req.exp_stat_sn.get();
            itt = req.initiator_task_tag;
            lun_field = req.lun.get();
            cdb = req.scsi_descriptor_block;
            edtl = req.expected_data_transfer_length.get();
            is_write = req.flags.write();
            data_len = req.get_data_length_bytes();
            immediate = req.immediate();
            ahs_len = req.get_ahs_length_bytes();
        }

        if ahs_len != 0 {
            // extended CDBs and bidirectional AHS are not accepted
            bail!("unexpected AHS of {ahs_len} bytes on SCSI command");
        }
        if is_write && edtl > self.sess_params.max_burst_length {
            warn!(
                "initiator transfer length ({edtl}) > negotiated MaxBurstLength ({})",
                self.sess_params.max_burst_length
            );
        }

        self.handle.note_cmd_sn(cmd_sn, exp_stat_sn, !immediate);

        if data_len > 0 && self.sess_params.first_burst_length != 0
            && data_len > self.sess_params.first_burst_length as usize
        {
            bail!(
                "immediate data ({data_len}) > FirstBurstLength ({})",
                self.sess_params.first_burst_length
            );
        }
        if data_len > 0
            && data_len > self.sess_params.max_recv_data_segment_length as usize
        {
            bail!(
                "immediate data ({data_len}) > MaxRecvDataSegmentLength ({})",
                self.sess_params.max_recv_data_segment_length
            );
        }
        if data_len > 0 && !self.sess_params.immediate_data {
            bail!("cannot accept any immediate data");
        }

        let tail = self.reader.read_exact_bytes(padded(data_len)).await?;
        let mut buffer = Vec::with_capacity(edtl as usize);
        buffer.extend_from_slice(&tail[..data_len]);

        if !is_write || buffer.len() as u32 >= edtl {
            self.submit_command(itt, lun_field, cdb, edtl, buffer);
            return Ok(());
        }

        // a write still waiting on Data-Out PDUs
        let received = buffer.len() as u32;
        buffer.resize(edtl as usize, 0);
        let mut pending = PendingWrite {
            lun_field,
            cdb,
            expected_len: edtl,
            buffer,
            received,
            r2t_sent: false,
            r2t_sn: 0,
        };

        // in R2T mode, or once the unsolicited first burst is exhausted, the
        // rest must be solicited
        if self.sess_params.initial_r2t
            || (self.sess_params.first_burst_length != 0
                && received >= self.sess_params.first_burst_length)
        {
            self.send_r2t(itt, &mut pending).await?;
        }
        self.pending_writes.insert(itt, pending);
        Ok(())
    }

    async fn send_r2t(&self, itt: u32, pending: &mut PendingWrite) -> Result<()> {
        let desired = pending.expected_len - pending.received;
        if desired > self.sess_params.max_burst_length {
            bail!(
                "bad xfer len: {desired} > {}",
                self.sess_params.max_burst_length
            );
        }

        let (stat_sn, exp_cmd_sn, max_cmd_sn) = self.handle.stat_sn();
        let builder = ReadyToTransferBuilder::new()
            .lun(pending.lun_field)
            .initiator_task_tag(itt)
            .target_transfer_tag(TTT_IN_PROGRESS)
            .stat_sn(stat_sn)
            .exp_cmd_sn(exp_cmd_sn)
            .max_cmd_sn(max_cmd_sn)
            .r2t_sn(pending.r2t_sn)
            .transfer(pending.received, desired);
        pending.r2t_sn += 1;
        pending.r2t_sent = true;

        let mut bhs = [0u8; HEADER_LEN];
        builder.header.to_bhs_bytes(&mut bhs)?;
        self.handle.writer.send(&bhs, &[]).await
    }

    async fn data_out(&mut self, header: &mut [u8; HEADER_LEN]) -> Result<()> {
        let (itt, exp_stat_sn, offset, data_len, final_bit);
        {
            let req = ScsiDataOut::from_bhs_bytes(header.as_mut_slice())?;
            itt = req.initiator_task_tag;
            exp_stat_sn = req.exp_stat_sn.get();
            offset = req.buffer_offset.get();
            data_len = req.get_data_length_bytes();
            final_bit = req.get_final_bit();
        }

        self.handle.note_cmd_sn(0, exp_stat_sn, false);

        let tail = self.reader.read_exact_bytes(padded(data_len)).await?;

        let Some(mut pending) = self.pending_writes.remove(&itt) else {
            warn!("Data-Out for unknown task tag {itt:#x}");
            return self
                .reject(header, RejectReason::InvalidPduField)
                .await;
        };

        if data_len > self.sess_params.max_recv_data_segment_length as usize
            || offset as usize + data_len > pending.buffer.len()
        {
            bail!(
                "Data-Out outside the transfer: offset {offset} len {data_len} of {}",
                pending.expected_len
            );
        }

        pending.buffer[offset as usize..offset as usize + data_len]
            .copy_from_slice(&tail[..data_len]);
        pending.received += data_len as u32;

        if pending.received >= pending.expected_len {
            if !final_bit {
                bail!("bad final bit on last Data-Out");
            }
            self.submit_command(
                itt,
                pending.lun_field,
                pending.cdb,
                pending.expected_len,
                pending.buffer,
            );
            return Ok(());
        }

        // not in R2T mode: once the unsolicited first burst is in, solicit
        // the remainder
        if !pending.r2t_sent
            && !self.sess_params.initial_r2t
            && self.sess_params.first_burst_length != 0
            && pending.received >= self.sess_params.first_burst_length
        {
            self.send_r2t(itt, &mut pending).await?;
        }
        self.pending_writes.insert(itt, pending);
        Ok(())
    }

    /// All payload bytes are in: run the command off the session loop so the
    /// next PDU can be read while the device works.
    fn submit_command(
        &mut self,
        itt: u32,
        lun_field: u64,
        cdb: [u8; 16],
        edtl: u32,
        data_out: Vec<u8>,
    ) {
        self.handle.inc_pending();
        let core = self.core.clone();
        let handle = self.handle.clone();
        let max_seg = self.sess_params.max_recv_data_segment_length;

        tokio::spawn(async move {
            let env = CommandEnv {
                local_session_id: handle.id,
                tag: itt,
                authorized: &|lun| handle.is_authorized(lun),
            };
            let status =
                dispatch::execute_command(&core.scsi, &env, lun_field, cdb, &data_out)
                    .await;

            if let Err(e) =
                send_command_response(&handle, itt, edtl, max_seg, status).await
            {
                error!("session {}: response send failed: {e}", handle.id);
            }
            handle.dec_pending();
        });
    }
}

/// Emit the response for a finished command: phase-collapsed Data-In for
/// successful reads, a SCSI Response PDU otherwise. Aborted commands emit
/// nothing at all.
async fn send_command_response(
    handle: &Arc<SessionHandle>,
    itt: u32,
    edtl: u32,
    max_seg: u32,
    status: CommandStatus,
) -> Result<()> {
    if status.status == ScsiStatus::TaskAborted {
        return Ok(());
    }

    if status.status == ScsiStatus::Good && !status.data.is_empty() {
        let mut data = status.data;
        if data.len() as u32 > edtl {
            data.truncate(edtl as usize);
        }
        let underflow = edtl.saturating_sub(data.len() as u32);

        let mut offset = 0usize;
        let mut data_sn = 0u32;
        let total = data.len();
        loop {
            let chunk_len = (total - offset).min(max_seg as usize);
            let last = offset + chunk_len >= total;

            let mut builder = ScsiDataInBuilder::new()
                .initiator_task_tag(itt)
                .data_sn(data_sn)
                .buffer_offset(offset as u32);
            if last {
                let (stat_sn, exp_cmd_sn, max_cmd_sn) = handle.next_stat_sn();
                builder = builder
                    .exp_cmd_sn(exp_cmd_sn)
                    .max_cmd_sn(max_cmd_sn)
                    .collapse_status(ScsiStatus::Good, stat_sn)
                    .residual_underflow(underflow);
            } else {
                let (_, exp_cmd_sn, max_cmd_sn) = handle.stat_sn();
                builder = builder.exp_cmd_sn(exp_cmd_sn).max_cmd_sn(max_cmd_sn);
            }
            let mut rsp_header = builder.header;
            rsp_header.set_data_length_bytes(chunk_len as u32);

            let mut bhs = [0u8; HEADER_LEN];
            rsp_header.to_bhs_bytes(&mut bhs)?;
            handle
                .writer
                .send_padded(&bhs, &data[offset..offset + chunk_len])
                .await?;

            if last {
                break;
            }
            offset += chunk_len;
            data_sn += 1;
        }
        return Ok(());
    }

    // status-only (or sense-bearing) response
    let (stat_sn, exp_cmd_sn, max_cmd_sn) = handle.next_stat_sn();
    let mut payload = Vec::new();
    if status.status == ScsiStatus::CheckCondition && !status.data.is_empty() {
        payload.extend_from_slice(&(status.data.len() as u16).to_be_bytes());
        payload.extend_from_slice(&status.data);
    }

    let builder = ScsiCommandResponseBuilder::new()
        .response(ResponseCode::CommandCompleted)
        .status(status.status)
        .initiator_task_tag(itt)
        .stat_sn(stat_sn)
        .exp_cmd_sn(exp_cmd_sn)
        .max_cmd_sn(max_cmd_sn);
    let mut rsp_header = builder.header;
    rsp_header.set_data_length_bytes(payload.len() as u32);

    let mut bhs = [0u8; HEADER_LEN];
    rsp_header.to_bhs_bytes(&mut bhs)?;
    handle.writer.send_padded(&bhs, &payload).await
}

#[inline]
fn padded(len: usize) -> usize {
    len + ((4 - (len % 4)) % 4)
}
