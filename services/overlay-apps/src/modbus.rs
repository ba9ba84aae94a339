//! Modbus/TCP peripheral
//!
//! A simulated PLC served over an overlay listener. Coils and holding
//! registers are stored and writable; discrete inputs and input registers are
//! sensor readings, sampled fresh on every read. One mutex-guarded state per
//! listener.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::{Mutex, PoisonError};

use overlay_sdk::{OverlayError, Result, ServiceProtocol};

/// MBAP header length including the unit id
pub const MBAP_LEN: usize = 7;
/// Largest Modbus/TCP application data unit
pub const MAX_ADU_LEN: usize = 260;
/// Entries per table
pub const TABLE_SIZE: usize = 256;

/// Sensor values are in 0..SENSOR_RANGE
const SENSOR_RANGE: u16 = 100;
const MAX_READ_BITS: u16 = 2000;
const MAX_READ_REGISTERS: u16 = 125;
const COIL_ON: u16 = 0xFF00;
const COIL_OFF: u16 = 0x0000;

pub const READ_COILS: u8 = 0x01;
pub const READ_DISCRETE_INPUTS: u8 = 0x02;
pub const READ_HOLDING_REGISTERS: u8 = 0x03;
pub const READ_INPUT_REGISTERS: u8 = 0x04;
pub const WRITE_SINGLE_COIL: u8 = 0x05;
pub const WRITE_SINGLE_REGISTER: u8 = 0x06;

/// Modbus exception codes this peripheral answers with
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExceptionCode {
    IllegalFunction = 0x01,
    IllegalDataAddress = 0x02,
    IllegalDataValue = 0x03,
}

impl ExceptionCode {
    fn from_u8(code: u8) -> Option<Self> {
        match code {
            0x01 => Some(ExceptionCode::IllegalFunction),
            0x02 => Some(ExceptionCode::IllegalDataAddress),
            0x03 => Some(ExceptionCode::IllegalDataValue),
            _ => None,
        }
    }
}

impl std::fmt::Display for ExceptionCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExceptionCode::IllegalFunction => write!(f, "illegal function"),
            ExceptionCode::IllegalDataAddress => write!(f, "illegal data address"),
            ExceptionCode::IllegalDataValue => write!(f, "illegal data value"),
        }
    }
}

/// One MBAP-framed message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame<T> {
    pub transaction_id: u16,
    pub unit_id: u8,
    pub body: T,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    ReadCoils { address: u16, quantity: u16 },
    ReadDiscreteInputs { address: u16, quantity: u16 },
    ReadHoldingRegisters { address: u16, quantity: u16 },
    ReadInputRegisters { address: u16, quantity: u16 },
    WriteSingleCoil { address: u16, value: bool },
    WriteSingleRegister { address: u16, value: u16 },
    /// Known function with a PDU of the wrong shape
    Malformed { function: u8 },
    Unsupported { function: u8 },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    Bits { function: u8, values: Vec<bool> },
    Registers { function: u8, values: Vec<u16> },
    /// Write acknowledgement echoing address and value
    Written { function: u8, address: u16, value: u16 },
    Exception { function: u8, code: ExceptionCode },
}

impl Request {
    fn from_pdu(pdu: &[u8]) -> Request {
        let function = pdu[0];
        let data = &pdu[1..];

        let pair = || -> Option<(u16, u16)> {
            (data.len() == 4).then(|| (be16(&data[0..2]), be16(&data[2..4])))
        };

        let parsed = match function {
            READ_COILS => {
                pair().map(|(address, quantity)| Request::ReadCoils { address, quantity })
            }
            READ_DISCRETE_INPUTS => {
                pair().map(|(address, quantity)| Request::ReadDiscreteInputs { address, quantity })
            }
            READ_HOLDING_REGISTERS => pair()
                .map(|(address, quantity)| Request::ReadHoldingRegisters { address, quantity }),
            READ_INPUT_REGISTERS => {
                pair().map(|(address, quantity)| Request::ReadInputRegisters { address, quantity })
            }
            WRITE_SINGLE_COIL => pair().and_then(|(address, raw)| match raw {
                COIL_ON => Some(Request::WriteSingleCoil { address, value: true }),
                COIL_OFF => Some(Request::WriteSingleCoil { address, value: false }),
                _ => None,
            }),
            WRITE_SINGLE_REGISTER => {
                pair().map(|(address, value)| Request::WriteSingleRegister { address, value })
            }
            other => return Request::Unsupported { function: other },
        };

        parsed.unwrap_or(Request::Malformed { function })
    }

    fn to_pdu(&self) -> Vec<u8> {
        let (function, a, b) = match *self {
            Request::ReadCoils { address, quantity } => (READ_COILS, address, quantity),
            Request::ReadDiscreteInputs { address, quantity } => {
                (READ_DISCRETE_INPUTS, address, quantity)
            }
            Request::ReadHoldingRegisters { address, quantity } => {
                (READ_HOLDING_REGISTERS, address, quantity)
            }
            Request::ReadInputRegisters { address, quantity } => {
                (READ_INPUT_REGISTERS, address, quantity)
            }
            Request::WriteSingleCoil { address, value } => {
                (WRITE_SINGLE_COIL, address, if value { COIL_ON } else { COIL_OFF })
            }
            Request::WriteSingleRegister { address, value } => {
                (WRITE_SINGLE_REGISTER, address, value)
            }
            Request::Malformed { function } | Request::Unsupported { function } => {
                return vec![function]
            }
        };
        let mut pdu = vec![function];
        pdu.extend_from_slice(&a.to_be_bytes());
        pdu.extend_from_slice(&b.to_be_bytes());
        pdu
    }
}

impl Response {
    fn to_pdu(&self) -> Vec<u8> {
        match self {
            Response::Bits { function, values } => {
                let mut packed = vec![0u8; values.len().div_ceil(8)];
                for (i, _) in values.iter().enumerate().filter(|(_, on)| **on) {
                    packed[i / 8] |= 1 << (i % 8);
                }
                let mut pdu = vec![*function, packed.len() as u8];
                pdu.extend_from_slice(&packed);
                pdu
            }
            Response::Registers { function, values } => {
                let mut pdu = vec![*function, (values.len() * 2) as u8];
                for v in values {
                    pdu.extend_from_slice(&v.to_be_bytes());
                }
                pdu
            }
            Response::Written {
                function,
                address,
                value,
            } => {
                let mut pdu = vec![*function];
                pdu.extend_from_slice(&address.to_be_bytes());
                pdu.extend_from_slice(&value.to_be_bytes());
                pdu
            }
            Response::Exception { function, code } => vec![function | 0x80, *code as u8],
        }
    }

    fn from_pdu(pdu: &[u8]) -> Result<Response> {
        let function = pdu[0];
        let data = &pdu[1..];

        if function & 0x80 != 0 {
            let code = data
                .first()
                .copied()
                .and_then(ExceptionCode::from_u8)
                .ok_or_else(|| OverlayError::Protocol("unknown exception code".to_string()))?;
            return Ok(Response::Exception {
                function: function & 0x7f,
                code,
            });
        }

        match function {
            READ_COILS | READ_DISCRETE_INPUTS => {
                let bytes = byte_counted(data)?;
                let values = (0..bytes.len() * 8)
                    .map(|i| bytes[i / 8] & (1 << (i % 8)) != 0)
                    .collect();
                Ok(Response::Bits { function, values })
            }
            READ_HOLDING_REGISTERS | READ_INPUT_REGISTERS => {
                let bytes = byte_counted(data)?;
                if bytes.len() % 2 != 0 {
                    return Err(OverlayError::Protocol("odd register byte count".to_string()));
                }
                let values = bytes.chunks_exact(2).map(be16).collect();
                Ok(Response::Registers { function, values })
            }
            WRITE_SINGLE_COIL | WRITE_SINGLE_REGISTER if data.len() == 4 => Ok(Response::Written {
                function,
                address: be16(&data[0..2]),
                value: be16(&data[2..4]),
            }),
            other => Err(OverlayError::Protocol(format!(
                "unexpected response function 0x{:02x}",
                other
            ))),
        }
    }
}

/// Split one complete ADU off the front of `buf`: (transaction id, unit id,
/// PDU, bytes consumed). `None` until the whole frame has arrived.
fn split_adu(buf: &[u8]) -> Result<Option<(u16, u8, &[u8], usize)>> {
    if buf.len() < MBAP_LEN {
        return Ok(None);
    }

    let transaction_id = be16(&buf[0..2]);
    let protocol_id = be16(&buf[2..4]);
    let length = be16(&buf[4..6]) as usize;

    if protocol_id != 0 {
        return Err(OverlayError::Protocol(format!(
            "unsupported MBAP protocol id {}",
            protocol_id
        )));
    }
    if length < 2 || 6 + length > MAX_ADU_LEN {
        return Err(OverlayError::Protocol(format!("invalid MBAP length {}", length)));
    }

    let total = 6 + length;
    if buf.len() < total {
        return Ok(None);
    }
    Ok(Some((transaction_id, buf[6], &buf[MBAP_LEN..total], total)))
}

fn write_adu(transaction_id: u16, unit_id: u8, pdu: &[u8], out: &mut Vec<u8>) {
    out.extend_from_slice(&transaction_id.to_be_bytes());
    out.extend_from_slice(&0u16.to_be_bytes());
    out.extend_from_slice(&((pdu.len() + 1) as u16).to_be_bytes());
    out.push(unit_id);
    out.extend_from_slice(pdu);
}

/// Client side: frame a request
pub fn encode_request(frame: &Frame<Request>) -> Vec<u8> {
    let mut out = Vec::with_capacity(MAX_ADU_LEN);
    write_adu(frame.transaction_id, frame.unit_id, &frame.body.to_pdu(), &mut out);
    out
}

/// Client side: parse a response frame
pub fn decode_response(buf: &[u8]) -> Result<Option<(Frame<Response>, usize)>> {
    let Some((transaction_id, unit_id, pdu, used)) = split_adu(buf)? else {
        return Ok(None);
    };
    let body = Response::from_pdu(pdu)?;
    Ok(Some((
        Frame {
            transaction_id,
            unit_id,
            body,
        },
        used,
    )))
}

/// Payload of a read response, checked against its leading byte count
fn byte_counted(data: &[u8]) -> Result<&[u8]> {
    let count = *data
        .first()
        .ok_or_else(|| OverlayError::Protocol("missing byte count".to_string()))? as usize;
    if data.len() != 1 + count {
        return Err(OverlayError::Protocol("byte count mismatch".to_string()));
    }
    Ok(&data[1..])
}

fn be16(bytes: &[u8]) -> u16 {
    u16::from_be_bytes([bytes[0], bytes[1]])
}

struct Tables {
    coils: Vec<bool>,
    holding: Vec<u16>,
    sensors: StdRng,
}

/// Simulated PLC
pub struct Peripheral {
    tables: Mutex<Tables>,
}

impl Peripheral {
    /// Tables seeded from OS entropy
    pub fn new() -> Self {
        Self::with_rng(StdRng::from_entropy())
    }

    /// Reproducible tables and sensor readings
    pub fn seeded(seed: u64) -> Self {
        Self::with_rng(StdRng::seed_from_u64(seed))
    }

    fn with_rng(mut rng: StdRng) -> Self {
        let coils = (0..TABLE_SIZE).map(|_| rng.gen_bool(0.5)).collect();
        let holding = (0..TABLE_SIZE).map(|_| rng.gen_range(0..SENSOR_RANGE)).collect();
        Self {
            tables: Mutex::new(Tables {
                coils,
                holding,
                sensors: rng,
            }),
        }
    }

    /// Answer one request
    pub fn respond(&self, request: Request) -> Response {
        use ExceptionCode::*;

        let exception = |function: u8, code: ExceptionCode| Response::Exception { function, code };
        let mut tables = self.tables.lock().unwrap_or_else(PoisonError::into_inner);

        match request {
            Request::ReadCoils { address, quantity }
            | Request::ReadDiscreteInputs { address, quantity } => {
                let function = if matches!(request, Request::ReadCoils { .. }) {
                    READ_COILS
                } else {
                    READ_DISCRETE_INPUTS
                };
                if quantity == 0 || quantity > MAX_READ_BITS {
                    return exception(function, IllegalDataValue);
                }
                let Some(range) = table_range(address, quantity) else {
                    return exception(function, IllegalDataAddress);
                };
                let values = if function == READ_COILS {
                    tables.coils[range].to_vec()
                } else {
                    range.map(|_| tables.sensors.gen_bool(0.5)).collect()
                };
                Response::Bits { function, values }
            }
            Request::ReadHoldingRegisters { address, quantity }
            | Request::ReadInputRegisters { address, quantity } => {
                let function = if matches!(request, Request::ReadHoldingRegisters { .. }) {
                    READ_HOLDING_REGISTERS
                } else {
                    READ_INPUT_REGISTERS
                };
                if quantity == 0 || quantity > MAX_READ_REGISTERS {
                    return exception(function, IllegalDataValue);
                }
                let Some(range) = table_range(address, quantity) else {
                    return exception(function, IllegalDataAddress);
                };
                let values = if function == READ_HOLDING_REGISTERS {
                    tables.holding[range].to_vec()
                } else {
                    range
                        .map(|_| tables.sensors.gen_range(0..SENSOR_RANGE))
                        .collect()
                };
                Response::Registers { function, values }
            }
            Request::WriteSingleCoil { address, value } => {
                let Some(slot) = tables.coils.get_mut(address as usize) else {
                    return exception(WRITE_SINGLE_COIL, IllegalDataAddress);
                };
                *slot = value;
                Response::Written {
                    function: WRITE_SINGLE_COIL,
                    address,
                    value: if value { COIL_ON } else { COIL_OFF },
                }
            }
            Request::WriteSingleRegister { address, value } => {
                let Some(slot) = tables.holding.get_mut(address as usize) else {
                    return exception(WRITE_SINGLE_REGISTER, IllegalDataAddress);
                };
                *slot = value;
                Response::Written {
                    function: WRITE_SINGLE_REGISTER,
                    address,
                    value,
                }
            }
            Request::Malformed { function } => exception(function, IllegalDataValue),
            Request::Unsupported { function } => exception(function, IllegalFunction),
        }
    }
}

impl Default for Peripheral {
    fn default() -> Self {
        Self::new()
    }
}

fn table_range(address: u16, quantity: u16) -> Option<std::ops::Range<usize>> {
    let start = address as usize;
    let end = start + quantity as usize;
    (end <= TABLE_SIZE).then_some(start..end)
}

impl ServiceProtocol for Peripheral {
    type Request = Frame<Request>;
    type Response = Frame<Response>;

    fn decode(&self, buf: &[u8]) -> Result<Option<(Frame<Request>, usize)>> {
        let Some((transaction_id, unit_id, pdu, used)) = split_adu(buf)? else {
            return Ok(None);
        };
        Ok(Some((
            Frame {
                transaction_id,
                unit_id,
                body: Request::from_pdu(pdu),
            },
            used,
        )))
    }

    fn handle(&self, request: Frame<Request>) -> Frame<Response> {
        Frame {
            transaction_id: request.transaction_id,
            unit_id: request.unit_id,
            body: self.respond(request.body),
        }
    }

    fn encode(&self, response: &Frame<Response>, out: &mut Vec<u8>) {
        write_adu(
            response.transaction_id,
            response.unit_id,
            &response.body.to_pdu(),
            out,
        );
    }
}
