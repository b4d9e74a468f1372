/// Frame codec for the Modbus-style protocol spoken over the BLE link
///
/// Requests are plain RTU read frames. Responses arrive as one or more
/// notification fragments which the connection layer concatenates before
/// handing the complete byte sequence to [`validate_response`].
///
/// ```text
/// request:  [unit, func, addr_hi, addr_lo, count_hi, count_lo, crc_lo, crc_hi]
/// success:  [unit, func, byte_count, payload..., crc_lo, crc_hi]
/// error:    [unit, func | 0x80, error_code, crc_lo, crc_hi]
/// ```

use crc::{Crc, CRC_16_MODBUS};
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::{debug, warn};

use crate::error::{RenogyError, RenogyResult};
use crate::utils::format::bytes_to_hex;

/// Modbus register address (0-65535)
pub type RegisterAddress = u16;

/// Protocol-level device address selecting the responder on a shared link
pub type UnitId = u8;

/// Header bytes preceding the payload of a success response
pub const RESPONSE_HEADER_LEN: usize = 3;

/// Trailing CRC bytes
pub const CRC_LEN: usize = 2;

/// Shortest frame that can carry any meaning (an error frame)
pub const MIN_RESPONSE_LEN: usize = 5;

/// Length of every read request frame
pub const REQUEST_LEN: usize = 8;

/// Bit set in the function byte of an error frame
pub const EXCEPTION_BIT: u8 = 0x80;

/// CRC calculator (poly 0xA001 reflected, init 0xFFFF)
const CRC_MODBUS: Crc<u16> = Crc::<u16>::new(&CRC_16_MODBUS);

/// Function codes used by the acquisition core
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum ModbusFunction {
    /// Read Holding Registers (0x03)
    ReadHoldingRegisters = 0x03,
    /// Read Input Registers (0x04)
    ReadInputRegisters = 0x04,
}

impl ModbusFunction {
    /// Convert from u8 to ModbusFunction
    pub fn from_u8(value: u8) -> RenogyResult<Self> {
        match value {
            0x03 => Ok(ModbusFunction::ReadHoldingRegisters),
            0x04 => Ok(ModbusFunction::ReadInputRegisters),
            _ => Err(RenogyError::protocol(format!(
                "Unsupported function code: 0x{:02X}",
                value
            ))),
        }
    }

    /// Convert to u8
    pub fn to_u8(self) -> u8 {
        self as u8
    }
}

impl fmt::Display for ModbusFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ModbusFunction::ReadHoldingRegisters => "Read Holding Registers",
            ModbusFunction::ReadInputRegisters => "Read Input Registers",
        };
        write!(f, "{} (0x{:02X})", name, *self as u8)
    }
}

/// Modbus exception codes carried by error frames
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ModbusException {
    IllegalFunction = 0x01,
    IllegalDataAddress = 0x02,
    IllegalDataValue = 0x03,
    ServerDeviceFailure = 0x04,
    Acknowledge = 0x05,
    ServerDeviceBusy = 0x06,
    MemoryParityError = 0x08,
    GatewayPathUnavailable = 0x0A,
    GatewayTargetDeviceFailedToRespond = 0x0B,
}

impl ModbusException {
    /// Convert from u8 to ModbusException
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x01 => Some(ModbusException::IllegalFunction),
            0x02 => Some(ModbusException::IllegalDataAddress),
            0x03 => Some(ModbusException::IllegalDataValue),
            0x04 => Some(ModbusException::ServerDeviceFailure),
            0x05 => Some(ModbusException::Acknowledge),
            0x06 => Some(ModbusException::ServerDeviceBusy),
            0x08 => Some(ModbusException::MemoryParityError),
            0x0A => Some(ModbusException::GatewayPathUnavailable),
            0x0B => Some(ModbusException::GatewayTargetDeviceFailedToRespond),
            _ => None,
        }
    }

    /// Convert to u8
    pub fn to_u8(self) -> u8 {
        self as u8
    }
}

/// A read request for one register group
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadRequest {
    pub unit_id: UnitId,
    pub function: ModbusFunction,
    pub address: RegisterAddress,
    pub word_count: u16,
}

impl ReadRequest {
    /// Create a holding-register read request
    pub fn new(unit_id: UnitId, address: RegisterAddress, word_count: u16) -> Self {
        Self {
            unit_id,
            function: ModbusFunction::ReadHoldingRegisters,
            address,
            word_count,
        }
    }

    /// Encode to a wire frame
    pub fn encode(&self) -> Vec<u8> {
        build_request(self.unit_id, self.function.to_u8(), self.address, self.word_count)
    }

    /// Total length of the success response this request should produce
    pub fn expected_response_len(&self) -> usize {
        expected_response_len(self.word_count)
    }
}

/// Compute the Modbus CRC16 of `data`
pub fn crc16(data: &[u8]) -> u16 {
    CRC_MODBUS.checksum(data)
}

/// Append the CRC of `frame` to it, low byte first
pub fn append_crc(frame: &mut Vec<u8>) {
    let crc = crc16(frame);
    frame.extend_from_slice(&crc.to_le_bytes());
}

/// Build a read request frame
///
/// Always produces exactly [`REQUEST_LEN`] bytes.
pub fn build_request(
    unit_id: UnitId,
    function: u8,
    address: RegisterAddress,
    word_count: u16,
) -> Vec<u8> {
    let mut frame = Vec::with_capacity(REQUEST_LEN);
    frame.push(unit_id);
    frame.push(function);
    frame.extend_from_slice(&address.to_be_bytes());
    frame.extend_from_slice(&word_count.to_be_bytes());
    append_crc(&mut frame);

    debug!("Built request: register={}, frame={}", address, bytes_to_hex(&frame));
    frame
}

/// Length of a complete success response for `word_count` registers
pub fn expected_response_len(word_count: u16) -> usize {
    RESPONSE_HEADER_LEN + word_count as usize * 2 + CRC_LEN
}

/// Returns `true` for a frame whose function byte carries the exception bit
pub fn is_error_frame(data: &[u8]) -> bool {
    data.len() >= MIN_RESPONSE_LEN && data[1] & EXCEPTION_BIT != 0
}

/// Check a response frame and report the precise reason it is unusable
///
/// The CRC covers `3 + byte_count` bytes; trailing bytes beyond the declared
/// frame (late notification fragments) are ignored.
pub fn check_response(data: &[u8], expected_unit_id: Option<UnitId>) -> RenogyResult<()> {
    if data.len() < MIN_RESPONSE_LEN {
        return Err(RenogyError::frame(format!(
            "Response too short: {} bytes",
            data.len()
        )));
    }

    if let Some(expected) = expected_unit_id {
        if data[0] != expected {
            return Err(RenogyError::protocol(format!(
                "Unexpected unit id: got {}, expected {}",
                data[0], expected
            )));
        }
    }

    if data[1] & EXCEPTION_BIT != 0 {
        return Err(RenogyError::exception(data[1] & !EXCEPTION_BIT, data[2]));
    }

    let byte_count = data[2] as usize;
    let frame_len = RESPONSE_HEADER_LEN + byte_count + CRC_LEN;
    if data.len() < frame_len {
        return Err(RenogyError::frame(format!(
            "Response incomplete: got {}, expected {}",
            data.len(),
            frame_len
        )));
    }

    let body = &data[..frame_len - CRC_LEN];
    let received = u16::from_le_bytes([data[frame_len - 2], data[frame_len - 1]]);
    let calculated = crc16(body);
    if received != calculated {
        return Err(RenogyError::crc_mismatch(calculated, received));
    }

    Ok(())
}

/// Validate a response frame
///
/// Never fails: malformed frames are logged and reported as `false` so the
/// caller can treat them as absent data.
pub fn validate_response(data: &[u8], expected_unit_id: Option<UnitId>) -> bool {
    match check_response(data, expected_unit_id) {
        Ok(()) => true,
        Err(err) => {
            warn!("Invalid response ({}): {}", err, bytes_to_hex(data));
            false
        }
    }
}

/// Payload bytes of a validated success response
pub fn payload(data: &[u8]) -> &[u8] {
    if data.len() < RESPONSE_HEADER_LEN {
        return &[];
    }
    let end = (RESPONSE_HEADER_LEN + data[2] as usize).min(data.len());
    &data[RESPONSE_HEADER_LEN..end]
}

/// Build a complete success response frame around `payload`
///
/// Used by the simulator and by tests.
pub fn build_response(unit_id: UnitId, function: u8, payload: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(RESPONSE_HEADER_LEN + payload.len() + CRC_LEN);
    frame.push(unit_id);
    frame.push(function);
    frame.push(payload.len() as u8);
    frame.extend_from_slice(payload);
    append_crc(&mut frame);
    frame
}

/// Build an error frame
pub fn build_exception(unit_id: UnitId, function: u8, code: u8) -> Vec<u8> {
    let mut frame = vec![unit_id, function | EXCEPTION_BIT, code];
    append_crc(&mut frame);
    frame
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_function_conversion() {
        assert_eq!(
            ModbusFunction::from_u8(0x03).unwrap(),
            ModbusFunction::ReadHoldingRegisters
        );
        assert_eq!(ModbusFunction::ReadHoldingRegisters.to_u8(), 0x03);
        assert!(ModbusFunction::from_u8(0x10).is_err());
    }

    #[test]
    fn test_exception_conversion() {
        assert_eq!(
            ModbusException::from_u8(0x02).unwrap(),
            ModbusException::IllegalDataAddress
        );
        assert_eq!(ModbusException::IllegalDataAddress.to_u8(), 0x02);
        assert!(ModbusException::from_u8(0x07).is_none());
    }

    #[test]
    fn test_crc_known_vectors() {
        assert_eq!(crc16(&[0x01, 0x03, 0x00, 0x00, 0x00, 0x02]), 0x0BC4);
        assert_eq!(crc16(&[0xFF, 0x03, 0x01, 0x00, 0x00, 0x22]), 0xF1D1);
        assert_eq!(crc16(&[0xFF, 0x83, 0x02]), 0x01A1);
    }

    #[test]
    fn test_build_request_layout() {
        let frame = build_request(0x01, 0x03, 0x0000, 0x0002);
        assert_eq!(frame, vec![0x01, 0x03, 0x00, 0x00, 0x00, 0x02, 0xC4, 0x0B]);

        let frame = build_request(0xFF, 0x03, 256, 34);
        assert_eq!(frame, vec![0xFF, 0x03, 0x01, 0x00, 0x00, 0x22, 0xD1, 0xF1]);

        let frame = ReadRequest::new(247, 5122, 6).encode();
        assert_eq!(frame, vec![0xF7, 0x03, 0x14, 0x02, 0x00, 0x06, 0x75, 0x6E]);
    }

    #[test]
    fn test_build_request_prefix_and_length() {
        for &(unit, func, addr, words) in &[
            (1u8, 3u8, 0u16, 1u16),
            (255, 3, 57348, 1),
            (247, 4, 5000, 17),
            (16, 3, 65535, 125),
        ] {
            let frame = build_request(unit, func, addr, words);
            assert_eq!(frame.len(), REQUEST_LEN);
            let [a_hi, a_lo] = addr.to_be_bytes();
            let [w_hi, w_lo] = words.to_be_bytes();
            assert_eq!(&frame[..6], &[unit, func, a_hi, a_lo, w_hi, w_lo]);
        }
    }

    #[test]
    fn test_validate_known_response() {
        let frame = [0x01, 0x03, 0x04, 0x00, 0x0A, 0x00, 0x0B, 0x9B, 0xF6];
        assert!(validate_response(&frame, Some(0x01)));
        assert!(validate_response(&frame, None));
        assert!(!validate_response(&frame, Some(0x02)));
        assert_eq!(payload(&frame), &[0x00, 0x0A, 0x00, 0x0B]);
    }

    #[test]
    fn test_validate_rejects_short_frame() {
        assert!(!validate_response(&[], None));
        assert!(!validate_response(&[0x01, 0x03, 0x00, 0x00], None));
    }

    #[test]
    fn test_validate_rejects_error_frame() {
        let frame = build_exception(0xFF, 0x03, 0x02);
        assert_eq!(frame, vec![0xFF, 0x83, 0x02, 0xA1, 0x01]);
        assert!(is_error_frame(&frame));
        assert!(!validate_response(&frame, Some(0xFF)));
        match check_response(&frame, Some(0xFF)) {
            Err(RenogyError::Exception { function, code, .. }) => {
                assert_eq!(function, 0x03);
                assert_eq!(code, 0x02);
            }
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[test]
    fn test_validate_rejects_truncated_frame() {
        let frame = build_response(0x01, 0x03, &[0x00, 0x01, 0x00, 0x02]);
        assert!(!validate_response(&frame[..frame.len() - 1], Some(0x01)));
        assert!(matches!(
            check_response(&frame[..6], Some(0x01)),
            Err(RenogyError::Frame { .. })
        ));
    }

    #[test]
    fn test_validate_ignores_trailing_bytes() {
        let mut frame = build_response(0x01, 0x03, &[0x12, 0x34]);
        frame.extend_from_slice(&[0xAA, 0xBB]);
        assert!(validate_response(&frame, Some(0x01)));
    }

    #[test]
    fn test_any_bit_flip_is_rejected() {
        let payload_bytes = [0x00u8, 0x64, 0x00, 0x7B, 0x01, 0x2C];
        let frame = build_response(0x10, 0x03, &payload_bytes);
        assert!(validate_response(&frame, Some(0x10)));

        // Flipping the unit id changes it to an unexpected value; flipping
        // the function or byte count turns the frame into an error frame or
        // changes its declared length. Every other bit breaks the CRC.
        for byte in 0..frame.len() {
            for bit in 0..8 {
                let mut corrupted = frame.clone();
                corrupted[byte] ^= 1 << bit;
                assert!(
                    !validate_response(&corrupted, Some(0x10)),
                    "flip of byte {} bit {} was accepted",
                    byte,
                    bit
                );
            }
        }
    }

    #[test]
    fn test_expected_response_len() {
        assert_eq!(expected_response_len(8), 21);
        assert_eq!(ReadRequest::new(255, 256, 34).expected_response_len(), 73);
    }
}
