//! Offload capabilities
//!
//! A device has a fixed *supported* set (from its backend) and a mutable
//! *enabled* set. Changing the enabled set is split in two so the engine can
//! run the hardware write in between, under its configuration lock:
//!
//! 1. `plan_*` validates the request and says which hardware switch, if
//!    any, has to move
//! 2. the engine writes the register
//! 3. `commit` stores the new enabled set, only if step 2 succeeded
//!
//! Transmit checksum bits never touch hardware here; the stack asks for
//! insertion per packet through [`PacketFlags`](crate::PacketFlags).
//! Receive checksum offload is one switch for all protocols, so it only moves
//! when the receive group as a whole turns on or off.

use bitflags::bitflags;

use crate::drivers::net::netdev::InfoError;

bitflags! {
    /// Offload capability word, as exchanged through `get_set_information`
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct Capabilities: u32 {
        const TX_IP_CHECKSUM = 1 << 0;
        const TX_UDP_CHECKSUM = 1 << 1;
        const TX_TCP_CHECKSUM = 1 << 2;
        const RX_IP_CHECKSUM = 1 << 3;
        const RX_UDP_CHECKSUM = 1 << 4;
        const RX_TCP_CHECKSUM = 1 << 5;
        const PROMISCUOUS = 1 << 8;

        const TX_CHECKSUM = Self::TX_IP_CHECKSUM.bits()
            | Self::TX_UDP_CHECKSUM.bits()
            | Self::TX_TCP_CHECKSUM.bits();
        const RX_CHECKSUM = Self::RX_IP_CHECKSUM.bits()
            | Self::RX_UDP_CHECKSUM.bits()
            | Self::RX_TCP_CHECKSUM.bits();
        const CHECKSUM = Self::TX_CHECKSUM.bits() | Self::RX_CHECKSUM.bits();
    }
}

/// Size of the information buffer for every setting
pub const INFORMATION_SIZE: usize = 4;

/// A validated checksum change
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChecksumChange {
    /// New state of the receive checksum switch, if it has to move
    pub rx_switch: Option<bool>,
    /// Enabled set to commit afterwards
    pub enabled: Capabilities,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CapabilitySet {
    supported: Capabilities,
    enabled: Capabilities,
}

impl CapabilitySet {
    /// Everything starts disabled
    pub fn new(supported: Capabilities) -> Self {
        Self {
            supported,
            enabled: Capabilities::empty(),
        }
    }

    pub fn supported(&self) -> Capabilities {
        self.supported
    }

    pub fn enabled(&self) -> Capabilities {
        self.enabled
    }

    pub fn checksum(&self) -> Capabilities {
        self.enabled & Capabilities::CHECKSUM
    }

    pub fn rx_checksum_enabled(&self) -> bool {
        self.enabled.intersects(Capabilities::RX_CHECKSUM)
    }

    pub fn promiscuous(&self) -> bool {
        self.enabled.contains(Capabilities::PROMISCUOUS)
    }

    /// Validate a new checksum word
    pub fn plan_checksum(&self, request: Capabilities) -> Result<ChecksumChange, InfoError> {
        let allowed = self.supported & Capabilities::CHECKSUM;
        if !allowed.contains(request) {
            return Err(InfoError::NotSupported);
        }

        let was_on = self.rx_checksum_enabled();
        let now_on = request.intersects(Capabilities::RX_CHECKSUM);

        Ok(ChecksumChange {
            rx_switch: (was_on != now_on).then_some(now_on),
            enabled: (self.enabled - Capabilities::CHECKSUM) | request,
        })
    }

    /// Validate a promiscuous-mode change
    ///
    /// Returns the new hardware state if the filter has to be reprogrammed.
    pub fn plan_promiscuous(&self, enable: bool) -> Result<Option<bool>, InfoError> {
        if !self.supported.contains(Capabilities::PROMISCUOUS) {
            return Err(InfoError::NotSupported);
        }
        Ok((self.promiscuous() != enable).then_some(enable))
    }

    pub fn commit_checksum(&mut self, change: &ChecksumChange) {
        self.enabled = change.enabled;
    }

    pub fn commit_promiscuous(&mut self, enable: bool) {
        self.enabled.set(Capabilities::PROMISCUOUS, enable);
    }
}

/// Read the 32-bit little-endian word from an information buffer
pub fn read_word(buffer: &[u8]) -> Result<u32, InfoError> {
    let bytes: [u8; INFORMATION_SIZE] =
        buffer.try_into().map_err(|_| InfoError::InvalidSize {
            expected: INFORMATION_SIZE,
            actual: buffer.len(),
        })?;
    Ok(u32::from_le_bytes(bytes))
}

/// Store a 32-bit little-endian word into an information buffer
pub fn write_word(buffer: &mut [u8], value: u32) -> Result<usize, InfoError> {
    if buffer.len() != INFORMATION_SIZE {
        return Err(InfoError::InvalidSize {
            expected: INFORMATION_SIZE,
            actual: buffer.len(),
        });
    }
    buffer.copy_from_slice(&value.to_le_bytes());
    Ok(INFORMATION_SIZE)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unsupported_checksum_rejected() {
        let caps = CapabilitySet::new(Capabilities::TX_CHECKSUM);

        assert_eq!(
            caps.plan_checksum(Capabilities::RX_TCP_CHECKSUM),
            Err(InfoError::NotSupported)
        );
        assert_eq!(caps.enabled(), Capabilities::empty());
    }

    #[test]
    fn test_rx_switch_moves_only_on_group_transition() {
        let mut caps = CapabilitySet::new(Capabilities::CHECKSUM);

        let change = caps.plan_checksum(Capabilities::RX_IP_CHECKSUM).unwrap();
        assert_eq!(change.rx_switch, Some(true));
        caps.commit_checksum(&change);

        // Still on, different protocol mix
        let change = caps
            .plan_checksum(Capabilities::RX_CHECKSUM | Capabilities::TX_TCP_CHECKSUM)
            .unwrap();
        assert_eq!(change.rx_switch, None);
        caps.commit_checksum(&change);
        assert_eq!(
            caps.checksum(),
            Capabilities::RX_CHECKSUM | Capabilities::TX_TCP_CHECKSUM
        );

        let change = caps.plan_checksum(Capabilities::TX_TCP_CHECKSUM).unwrap();
        assert_eq!(change.rx_switch, Some(false));
    }

    #[test]
    fn test_checksum_change_keeps_promiscuous() {
        let mut caps = CapabilitySet::new(Capabilities::all());
        caps.commit_promiscuous(true);

        let change = caps.plan_checksum(Capabilities::TX_IP_CHECKSUM).unwrap();
        caps.commit_checksum(&change);

        assert!(caps.promiscuous());
        assert_eq!(caps.checksum(), Capabilities::TX_IP_CHECKSUM);
    }

    #[test]
    fn test_promiscuous_plan() {
        let caps = CapabilitySet::new(Capabilities::empty());
        assert_eq!(caps.plan_promiscuous(true), Err(InfoError::NotSupported));

        let mut caps = CapabilitySet::new(Capabilities::PROMISCUOUS);
        assert_eq!(caps.plan_promiscuous(false), Ok(None));
        assert_eq!(caps.plan_promiscuous(true), Ok(Some(true)));
        caps.commit_promiscuous(true);
        assert_eq!(caps.plan_promiscuous(true), Ok(None));
    }

    #[test]
    fn test_word_buffers() {
        assert_eq!(read_word(&[0x01, 0x02, 0, 0]), Ok(0x0201));
        assert_eq!(
            read_word(&[0; 8]),
            Err(InfoError::InvalidSize {
                expected: 4,
                actual: 8
            })
        );

        let mut buffer = [0u8; 4];
        assert_eq!(write_word(&mut buffer, 0x0102_0304), Ok(4));
        assert_eq!(buffer, [4, 3, 2, 1]);
    }
}
