// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{any::type_name, fmt, marker::PhantomData, ops::Deref};

use anyhow::{Context, Result, anyhow, bail};
use bytes::{Bytes, BytesMut};
use zerocopy::{FromBytes as ZFromBytes, Immutable, IntoBytes, KnownLayout};

use crate::{
    models::{
        common::{BasicHeaderSegment, Builder, HEADER_LEN, SendingData},
        data::sense_data::SenseData,
        opcode::Opcode,
    },
    target::connection::FromBytes,
};

pub trait ZeroCopyType: KnownLayout + Immutable + IntoBytes + ZFromBytes {}

#[inline]
fn pad_len(n: usize) -> usize {
    (4 - (n % 4)) % 4
}

pub type PduRequest<T> = PduWithData<T, Bytes>;
pub type PduResponse<T> = PduWithData<T, BytesMut>;

/// A 48-byte BHS plus its Data-Segment.
///
/// On the receive side (`Bytes` body) the payload is the raw frame tail as
/// it came off the socket; on the send side (`BytesMut` body) data is
/// appended and the header's DataSegmentLength kept in sync. The digest
/// lanes of the wire format do not exist here: this target negotiates
/// `HeaderDigest=None` and `DataDigest=None` only.
#[derive(PartialEq)]
pub struct PduWithData<T, Body = Bytes> {
    pub header_buf: [u8; HEADER_LEN],
    payload: Body,

    _marker: PhantomData<T>,
}

impl<T> Builder for PduWithData<T, BytesMut>
where T: BasicHeaderSegment + SendingData + FromBytes + ZeroCopyType
{
    type Body = Vec<u8>;
    type Header = [u8; HEADER_LEN];

    /// Appends raw bytes to the Data Segment and updates its length field.
    fn append_data(&mut self, more: &[u8]) {
        self.payload.extend_from_slice(more);
        let len = self.payload.len() as u32;
        self.header_view_mut()
            .expect("append_data on uninitialized header_buf")
            .set_data_length_bytes(len);
    }

    /// Build the final frame (BHS + padded DataSegment).
    fn build(
        &mut self,
        max_recv_data_segment_length: usize,
    ) -> Result<(Self::Header, Vec<u8>)> {
        if max_recv_data_segment_length < self.payload.len() {
            bail!(
                "MaxRecvDataSegmentLength is less than data len: {}",
                self.payload.len()
            );
        }

        {
            let header = self.header_view_mut().context("building without header")?;
            let opcode = header.get_opcode()?.opcode;

            // Data-Out and Logout manage F themselves during staged sends.
            if opcode != Opcode::ScsiDataOut && opcode != Opcode::LogoutReq {
                header.set_final_bit();
            }
        }

        let data_len = self.payload.len();
        let mut body = Vec::with_capacity(data_len + pad_len(data_len));
        body.extend_from_slice(&self.payload);
        body.extend(std::iter::repeat_n(0u8, pad_len(data_len)));

        Ok((self.header_buf, body))
    }
}

impl<T> PduWithData<T, Bytes> {
    /// Wrap a received header; attach the frame tail via
    /// [`PduWithData::parse_with_buff`].
    pub fn from_header_slice(header_buf: [u8; HEADER_LEN]) -> Self {
        Self {
            header_buf,
            payload: Bytes::new(),
            _marker: PhantomData,
        }
    }
}

impl<T> PduWithData<T, BytesMut> {
    pub fn new_response(header_buf: [u8; HEADER_LEN]) -> Self {
        Self {
            header_buf,
            payload: BytesMut::new(),
            _marker: PhantomData,
        }
    }
}

impl<T, B> PduWithData<T, B>
where
    T: BasicHeaderSegment,
    B: Deref<Target = [u8]>,
{
    #[inline]
    pub fn header_view(&self) -> Result<&T>
    where T: FromBytes + ZeroCopyType {
        T::ref_from_bytes(self.header_buf.as_slice())
            .map_err(|e| anyhow!("{}", e.to_string()))
    }

    #[inline]
    pub fn header_view_mut(&mut self) -> Result<&mut T>
    where T: FromBytes + ZeroCopyType {
        T::mut_from_bytes(self.header_buf.as_mut_slice())
            .map_err(|e| anyhow!("{}", e.to_string()))
    }

    /// The Data-Segment bytes (AHS skipped, padding stripped).
    pub fn data(&self) -> Result<&[u8]>
    where T: FromBytes + ZeroCopyType {
        let header = self.header_view()?;
        let ahs_size = header.get_ahs_length_bytes();
        let data_sz = header.get_data_length_bytes();
        let skip = ahs_size + pad_len(ahs_size);
        if self.payload.len() < skip + data_sz {
            bail!(
                "{}: truncated payload: have {}, need {}",
                type_name::<T>(),
                self.payload.len(),
                skip + data_sz
            );
        }
        Ok(&self.payload[skip..skip + data_sz])
    }
}

impl<T> PduWithData<T, Bytes>
where T: BasicHeaderSegment + FromBytes + ZeroCopyType
{
    /// Attach the frame tail: AHS + pad(AHS) + Data + pad(Data).
    pub fn parse_with_buff(&mut self, buf: &Bytes) -> Result<()> {
        let tn = type_name::<T>();
        let h = self.header_view().context("parsing without header_buf")?;

        let ahs_len = h.get_ahs_length_bytes();
        let data_len = h.get_data_length_bytes();

        let need = ahs_len + pad_len(ahs_len) + data_len + pad_len(data_len);
        if buf.len() < need {
            bail!("{tn}: buffer too small: have {}, need {}", buf.len(), need);
        }

        self.payload = buf.clone();
        Ok(())
    }
}

struct HexPreview<'a>(&'a [u8]);

impl<'a> fmt::Debug for HexPreview<'a> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const MAX: usize = 128;
        let slice = if self.0.len() > MAX {
            &self.0[..MAX]
        } else {
            self.0
        };
        let mut first = true;
        write!(f, "\"")?;
        for b in slice {
            if !first {
                write!(f, " ")?;
            }
            write!(f, "{b:02x}")?;
            first = false;
        }
        if self.0.len() > MAX {
            write!(f, " ... (+{} bytes)", self.0.len() - MAX)?;
        }
        write!(f, "\"")
    }
}


impl<T, B> fmt::Debug for PduWithData<T, B>
where
    T: BasicHeaderSegment + SendingData + FromBytes + fmt::Debug + ZeroCopyType,
    B: Deref<Target = [u8]>,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut ds = f.debug_struct("PduWithData");

        match self.header_view() {
            Ok(header) => ds.field("header", &header),
            Err(_) => ds.field("header", &"<invalid>"),
        };

        match self.data() {
            Ok(data) if !data.is_empty() => {
                ds.field("data_len", &data.len());
                // Response payloads that look like sense data get decoded for
                // the logs.
                if self
                    .header_view()
                    .ok()
                    .and_then(|h| h.get_opcode().ok())
                    .map(|op| op.opcode)
                    == Some(Opcode::ScsiCommandResp)
                {
                    match SenseData::parse(data) {
                        Ok(sense) => {
                            ds.field("sense", &sense);
                        },
                        Err(_) => {
                            ds.field("data_preview", &HexPreview(data));
                        },
                    }
                } else {
                    ds.field("data_preview", &HexPreview(data));
                }
            },
            _ => {
                ds.field("data", &"[]");
            },
        }

        ds.finish()
    }
}
