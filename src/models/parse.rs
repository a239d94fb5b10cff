// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use anyhow::Result;
use enum_dispatch::enum_dispatch;

use crate::models::{
    async_message::response::AsyncMessage,
    command::{request::ScsiCommandRequest, response::ScsiCommandResponse},
    common::{BasicHeaderSegment, SendingData},
    data::{request::ScsiDataOut, response::ScsiDataIn},
    login::{request::LoginRequest, response::LoginResponse},
    logout::{request::LogoutRequest, response::LogoutResponse},
    nop::{request::NopOutRequest, response::NopInResponse},
    opcode::{BhsOpcode, Opcode},
    ready_2_transfer::response::ReadyToTransfer,
    reject::response::RejectPdu,
    task::{request::TaskMgmtRequest, response::TaskMgmtResponse},
    text::{request::TextRequest, response::TextResponse},
};

/// A parsed BHS, borrowing the 48 header bytes in place.
#[enum_dispatch(BasicHeaderSegment, SendingData)]
#[derive(Debug)]
pub enum Pdu<'a> {
    NopOutRequest(&'a mut NopOutRequest),
    ScsiCommandRequest(&'a mut ScsiCommandRequest),
    TaskMgmtRequest(&'a mut TaskMgmtRequest),
    TextRequest(&'a mut TextRequest),
    LoginRequest(&'a mut LoginRequest),
    ScsiDataOut(&'a mut ScsiDataOut),
    LogoutRequest(&'a mut LogoutRequest),
    NopInResponse(&'a mut NopInResponse),
    ScsiCommandResponse(&'a mut ScsiCommandResponse),
    TaskMgmtResponse(&'a mut TaskMgmtResponse),
    TextResponse(&'a mut TextResponse),
    LoginResponse(&'a mut LoginResponse),
    ScsiDataIn(&'a mut ScsiDataIn),
    LogoutResponse(&'a mut LogoutResponse),
    ReadyToTransfer(&'a mut ReadyToTransfer),
    AsyncMessage(&'a mut AsyncMessage),
    RejectPdu(&'a mut RejectPdu),
}

impl<'a> Pdu<'a> {
    pub fn from_bhs_bytes(bytes: &'a mut [u8]) -> Result<Self> {
        let bhs = BhsOpcode::try_from(bytes[0])
            .map_err(|e| anyhow::anyhow!("invalid opcode: {}", e))?;
        match bhs.opcode {
            Opcode::NopOut => Ok(Pdu::NopOutRequest(NopOutRequest::from_bhs_bytes(bytes)?)),
            Opcode::ScsiCommandReq => Ok(Pdu::ScsiCommandRequest(
                ScsiCommandRequest::from_bhs_bytes(bytes)?,
            )),
            Opcode::ScsiTaskMgmtReq => {
                Ok(Pdu::TaskMgmtRequest(TaskMgmtRequest::from_bhs_bytes(bytes)?))
            },
            Opcode::TextReq => Ok(Pdu::TextRequest(TextRequest::from_bhs_bytes(bytes)?)),
            Opcode::LoginReq => Ok(Pdu::LoginRequest(LoginRequest::from_bhs_bytes(bytes)?)),
            Opcode::ScsiDataOut => Ok(Pdu::ScsiDataOut(ScsiDataOut::from_bhs_bytes(bytes)?)),
            Opcode::LogoutReq => {
                Ok(Pdu::LogoutRequest(LogoutRequest::from_bhs_bytes(bytes)?))
            },
            Opcode::NopIn => Ok(Pdu::NopInResponse(NopInResponse::from_bhs_bytes(bytes)?)),
            Opcode::ScsiCommandResp => Ok(Pdu::ScsiCommandResponse(
                ScsiCommandResponse::from_bhs_bytes(bytes)?,
            )),
            Opcode::ScsiTaskMgmtResp => Ok(Pdu::TaskMgmtResponse(
                TaskMgmtResponse::from_bhs_bytes(bytes)?,
            )),
            Opcode::TextResp => Ok(Pdu::TextResponse(TextResponse::from_bhs_bytes(bytes)?)),
            Opcode::LoginResp => {
                Ok(Pdu::LoginResponse(LoginResponse::from_bhs_bytes(bytes)?))
            },
            Opcode::ScsiDataIn => Ok(Pdu::ScsiDataIn(ScsiDataIn::from_bhs_bytes(bytes)?)),
            Opcode::LogoutResp => {
                Ok(Pdu::LogoutResponse(LogoutResponse::from_bhs_bytes(bytes)?))
            },
            Opcode::ReadyToTransfer => Ok(Pdu::ReadyToTransfer(
                ReadyToTransfer::from_bhs_bytes(bytes)?,
            )),
            Opcode::AsyncMessage => {
                Ok(Pdu::AsyncMessage(AsyncMessage::from_bhs_bytes(bytes)?))
            },
            Opcode::Reject => Ok(Pdu::RejectPdu(RejectPdu::from_bhs_bytes(bytes)?)),
        }
    }
}
