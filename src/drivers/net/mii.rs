//! IEEE 802.3 clause 22 PHY management
//!
//! Backends with a management bus implement [`Mdio`]; everything else here
//! (PHY discovery, advertisement, link decode) is shared.
//!
//! ## Link decode
//!
//! 1. BMSR is read twice and OR-ed: the link bit latches low, so the first
//!    read may report a drop that has already recovered
//! 2. Link bit clear, or PHY isolated: down
//! 3. Autonegotiation enabled: must be complete, then the highest common
//!    mode of (ADVERTISE, CTRL1000) and (LPA, STAT1000) wins
//! 4. Autonegotiation disabled: BMCR forced speed/duplex bits

use bitflags::bitflags;

use crate::drivers::net::netdev::{Duplex, HardwareError, LinkSpeed, LinkState};
use crate::drivers::timer::{poll_until, Clock};

// ============================================================================
// Register Map
// ============================================================================

pub const MII_BMCR: u8 = 0x00;
pub const MII_BMSR: u8 = 0x01;
pub const MII_PHYSID1: u8 = 0x02;
pub const MII_PHYSID2: u8 = 0x03;
pub const MII_ADVERTISE: u8 = 0x04;
pub const MII_LPA: u8 = 0x05;
pub const MII_CTRL1000: u8 = 0x09;
pub const MII_STAT1000: u8 = 0x0A;

/// Addresses on one management bus
pub const MII_PHY_COUNT: u8 = 32;

// BMCR bits
pub const BMCR_RESET: u16 = 1 << 15;
pub const BMCR_LOOPBACK: u16 = 1 << 14;
pub const BMCR_SPEED100: u16 = 1 << 13;
pub const BMCR_ANENABLE: u16 = 1 << 12;
pub const BMCR_ISOLATE: u16 = 1 << 10;
pub const BMCR_ANRESTART: u16 = 1 << 9;
pub const BMCR_FULLDPLX: u16 = 1 << 8;
pub const BMCR_SPEED1000: u16 = 1 << 6;

// BMSR bits
pub const BMSR_100BASE4: u16 = 1 << 15;
pub const BMSR_100FULL: u16 = 1 << 14;
pub const BMSR_100HALF: u16 = 1 << 13;
pub const BMSR_10FULL: u16 = 1 << 12;
pub const BMSR_10HALF: u16 = 1 << 11;
pub const BMSR_ESTATEN: u16 = 1 << 8;
pub const BMSR_ANEGCOMPLETE: u16 = 1 << 5;
pub const BMSR_LSTATUS: u16 = 1 << 2;

/// Any of the media ability bits
pub const BMSR_MEDIA_MASK: u16 =
    BMSR_100BASE4 | BMSR_100FULL | BMSR_100HALF | BMSR_10FULL | BMSR_10HALF;

// ADVERTISE / LPA bits (same layout)
pub const ADVERTISE_CSMA: u16 = 1 << 0;
pub const ADVERTISE_10HALF: u16 = 1 << 5;
pub const ADVERTISE_10FULL: u16 = 1 << 6;
pub const ADVERTISE_100HALF: u16 = 1 << 7;
pub const ADVERTISE_100FULL: u16 = 1 << 8;
pub const ADVERTISE_100BASE4: u16 = 1 << 9;
pub const ADVERTISE_PAUSE: u16 = 1 << 10;
pub const ADVERTISE_PAUSE_ASYM: u16 = 1 << 11;
pub const ADVERTISE_ALL: u16 =
    ADVERTISE_10HALF | ADVERTISE_10FULL | ADVERTISE_100HALF | ADVERTISE_100FULL;

// CTRL1000 / STAT1000 bits
pub const CTRL1000_ADVERTISE_1000HALF: u16 = 1 << 8;
pub const CTRL1000_ADVERTISE_1000FULL: u16 = 1 << 9;
pub const STAT1000_PARTNER_1000HALF: u16 = 1 << 10;
pub const STAT1000_PARTNER_1000FULL: u16 = 1 << 11;

const PHY_RESET_POLL_US: u64 = 100;

// ============================================================================
// Management Bus
// ============================================================================

/// Clause 22 register access
///
/// Implementations poll their busy bit against a deadline and report
/// [`HardwareError::Timeout`] rather than spinning forever.
pub trait Mdio {
    fn mdio_read(&self, phy: u8, reg: u8) -> Result<u16, HardwareError>;

    fn mdio_write(&self, phy: u8, reg: u8, value: u16) -> Result<(), HardwareError>;
}

/// Scan the bus for the first address whose BMSR looks like a PHY
///
/// Empty addresses read back all zeros or all ones; a real PHY reports at
/// least one media ability or extended status.
pub fn probe_phy(mdio: &dyn Mdio) -> Result<u8, HardwareError> {
    for phy in 0..MII_PHY_COUNT {
        let Ok(bmsr) = mdio.mdio_read(phy, MII_BMSR) else {
            continue;
        };

        if bmsr != 0 && bmsr != 0xFFFF && bmsr & (BMSR_MEDIA_MASK | BMSR_ESTATEN) != 0 {
            return Ok(phy);
        }
    }

    Err(HardwareError::PhyNotFound)
}

/// 32-bit PHY identifier (PHYSID1:PHYSID2)
pub fn read_phy_id(mdio: &dyn Mdio, phy: u8) -> Result<u32, HardwareError> {
    let id1 = mdio.mdio_read(phy, MII_PHYSID1)? as u32;
    let id2 = mdio.mdio_read(phy, MII_PHYSID2)? as u32;
    Ok((id1 << 16) | id2)
}

/// Reset the PHY and advertise every 10/100 mode plus pause
pub fn configure_phy(
    mdio: &dyn Mdio,
    phy: u8,
    clock: &(impl Clock + ?Sized),
    timeout_us: u64,
) -> Result<(), HardwareError> {
    mdio.mdio_write(phy, MII_BMCR, BMCR_RESET)?;

    let mut failure = None;
    poll_until(clock, timeout_us, PHY_RESET_POLL_US, || {
        match mdio.mdio_read(phy, MII_BMCR) {
            Ok(bmcr) => bmcr & BMCR_RESET == 0,
            Err(e) => {
                failure = Some(e);
                true
            }
        }
    })
    .map_err(|_| HardwareError::Timeout("PHY reset"))?;
    if let Some(e) = failure {
        return Err(e);
    }

    let advertise = ADVERTISE_ALL | ADVERTISE_CSMA | ADVERTISE_PAUSE | ADVERTISE_PAUSE_ASYM;
    mdio.mdio_write(phy, MII_ADVERTISE, advertise)
}

// ============================================================================
// Link Resolution
// ============================================================================

bitflags! {
    /// Link modes, independent of register layout
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct Abilities: u16 {
        const HALF_10 = 1 << 0;
        const FULL_10 = 1 << 1;
        const HALF_100 = 1 << 2;
        const T4_100 = 1 << 3;
        const FULL_100 = 1 << 4;
        const HALF_1000 = 1 << 5;
        const FULL_1000 = 1 << 6;
    }
}

/// Highest priority first
const PRECEDENCE: [(Abilities, LinkSpeed, Duplex); 7] = [
    (Abilities::FULL_1000, LinkSpeed::Mbps1000, Duplex::Full),
    (Abilities::HALF_1000, LinkSpeed::Mbps1000, Duplex::Half),
    (Abilities::FULL_100, LinkSpeed::Mbps100, Duplex::Full),
    (Abilities::T4_100, LinkSpeed::Mbps100, Duplex::Half),
    (Abilities::HALF_100, LinkSpeed::Mbps100, Duplex::Half),
    (Abilities::FULL_10, LinkSpeed::Mbps10, Duplex::Full),
    (Abilities::HALF_10, LinkSpeed::Mbps10, Duplex::Half),
];

impl Abilities {
    /// Decode an ADVERTISE or LPA word plus a CTRL1000 or STAT1000 word
    ///
    /// `gigabit` must already be in CTRL1000 layout; STAT1000's partner bits
    /// sit two positions higher and are shifted down by the caller.
    pub fn from_registers(base: u16, gigabit: u16) -> Self {
        let mut abilities = Abilities::empty();
        for (bit, ability) in [
            (ADVERTISE_10HALF, Abilities::HALF_10),
            (ADVERTISE_10FULL, Abilities::FULL_10),
            (ADVERTISE_100HALF, Abilities::HALF_100),
            (ADVERTISE_100FULL, Abilities::FULL_100),
            (ADVERTISE_100BASE4, Abilities::T4_100),
        ] {
            if base & bit != 0 {
                abilities |= ability;
            }
        }
        if gigabit & CTRL1000_ADVERTISE_1000HALF != 0 {
            abilities |= Abilities::HALF_1000;
        }
        if gigabit & CTRL1000_ADVERTISE_1000FULL != 0 {
            abilities |= Abilities::FULL_1000;
        }
        abilities
    }
}

/// Pick the best mode both ends support
pub fn resolve(local: Abilities, partner: Abilities) -> LinkState {
    let common = local & partner;
    PRECEDENCE
        .iter()
        .find(|(ability, _, _)| common.contains(*ability))
        .map_or(LinkState::Down, |&(_, speed, duplex)| LinkState::Up {
            speed,
            duplex,
        })
}

/// Speed and duplex from BMCR when autonegotiation is off
pub fn forced_mode(bmcr: u16) -> LinkState {
    let speed = if bmcr & BMCR_SPEED1000 != 0 {
        LinkSpeed::Mbps1000
    } else if bmcr & BMCR_SPEED100 != 0 {
        LinkSpeed::Mbps100
    } else {
        LinkSpeed::Mbps10
    };
    let duplex = if bmcr & BMCR_FULLDPLX != 0 {
        Duplex::Full
    } else {
        Duplex::Half
    };
    LinkState::Up { speed, duplex }
}

/// Read and decode the PHY's current link
pub fn read_link(mdio: &dyn Mdio, phy: u8) -> Result<LinkState, HardwareError> {
    let bmsr = mdio.mdio_read(phy, MII_BMSR)? | mdio.mdio_read(phy, MII_BMSR)?;
    if bmsr & BMSR_LSTATUS == 0 {
        return Ok(LinkState::Down);
    }

    let bmcr = mdio.mdio_read(phy, MII_BMCR)?;
    if bmcr & BMCR_ISOLATE != 0 {
        return Ok(LinkState::Down);
    }
    if bmcr & BMCR_LOOPBACK != 0 {
        log::debug!("[mii] PHY {} has loopback enabled", phy);
    }

    if bmcr & BMCR_ANENABLE == 0 {
        return Ok(forced_mode(bmcr));
    }

    if bmsr & BMSR_ANEGCOMPLETE == 0 {
        return Ok(LinkState::Down);
    }

    let advertise = mdio.mdio_read(phy, MII_ADVERTISE)?;
    let partner = mdio.mdio_read(phy, MII_LPA)?;

    let (ctrl1000, stat1000) = if bmsr & BMSR_ESTATEN != 0 {
        (
            mdio.mdio_read(phy, MII_CTRL1000)?,
            mdio.mdio_read(phy, MII_STAT1000)?,
        )
    } else {
        (0, 0)
    };

    let local = Abilities::from_registers(advertise, ctrl1000);
    let remote = Abilities::from_registers(partner, stat1000 >> 2);
    Ok(resolve(local, remote))
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::cell::RefCell;

    /// PHY register file at a single address
    struct FakePhy {
        address: u8,
        regs: RefCell<[u16; 32]>,
        bmsr_reads: RefCell<usize>,
        /// First BMSR read of a pair reports the latched-low link bit
        latched_low: bool,
    }

    impl FakePhy {
        fn new(address: u8) -> Self {
            Self {
                address,
                regs: RefCell::new([0; 32]),
                bmsr_reads: RefCell::new(0),
                latched_low: false,
            }
        }

        fn set(&self, reg: u8, value: u16) {
            self.regs.borrow_mut()[reg as usize] = value;
        }
    }

    impl Mdio for FakePhy {
        fn mdio_read(&self, phy: u8, reg: u8) -> Result<u16, HardwareError> {
            if phy != self.address {
                return Ok(0xFFFF);
            }
            let mut value = self.regs.borrow()[reg as usize];
            if reg == MII_BMSR {
                let mut reads = self.bmsr_reads.borrow_mut();
                if self.latched_low && *reads % 2 == 0 {
                    value &= !BMSR_LSTATUS;
                }
                *reads += 1;
            }
            Ok(value)
        }

        fn mdio_write(&self, phy: u8, reg: u8, value: u16) -> Result<(), HardwareError> {
            if phy == self.address {
                // Reset self-clears immediately
                self.set(reg, value & !BMCR_RESET);
            }
            Ok(())
        }
    }

    fn autoneg_phy(advertise: u16, partner: u16) -> FakePhy {
        let phy = FakePhy::new(1);
        phy.set(MII_BMSR, BMSR_LSTATUS | BMSR_ANEGCOMPLETE | BMSR_100FULL);
        phy.set(MII_BMCR, BMCR_ANENABLE);
        phy.set(MII_ADVERTISE, advertise);
        phy.set(MII_LPA, partner);
        phy
    }

    #[test]
    fn test_resolve_picks_highest_common_mode() {
        let local = Abilities::HALF_10 | Abilities::FULL_10 | Abilities::HALF_100;
        let partner = Abilities::FULL_10 | Abilities::FULL_100;

        assert_eq!(
            resolve(local, partner),
            LinkState::Up {
                speed: LinkSpeed::Mbps10,
                duplex: Duplex::Full
            }
        );
    }

    #[test]
    fn test_resolve_without_common_mode_is_down() {
        assert_eq!(
            resolve(Abilities::FULL_100, Abilities::HALF_10),
            LinkState::Down
        );
    }

    #[test]
    fn test_half_duplex_gigabit_and_t4_resolve_half() {
        assert_eq!(
            resolve(Abilities::HALF_1000, Abilities::HALF_1000),
            LinkState::Up {
                speed: LinkSpeed::Mbps1000,
                duplex: Duplex::Half
            }
        );
        assert_eq!(
            resolve(Abilities::T4_100 | Abilities::HALF_100, Abilities::T4_100),
            LinkState::Up {
                speed: LinkSpeed::Mbps100,
                duplex: Duplex::Half
            }
        );
    }

    #[test]
    fn test_probe_skips_empty_addresses() {
        let phy = FakePhy::new(7);
        phy.set(MII_BMSR, BMSR_100FULL | BMSR_10HALF);

        assert_eq!(probe_phy(&phy), Ok(7));
    }

    #[test]
    fn test_probe_without_phy() {
        let phy = FakePhy::new(3);
        assert_eq!(probe_phy(&phy), Err(HardwareError::PhyNotFound));
    }

    #[test]
    fn test_read_link_autonegotiated() {
        let phy = autoneg_phy(ADVERTISE_ALL, ADVERTISE_100FULL | ADVERTISE_10FULL);

        assert_eq!(
            read_link(&phy, 1),
            Ok(LinkState::Up {
                speed: LinkSpeed::Mbps100,
                duplex: Duplex::Full
            })
        );
    }

    #[test]
    fn test_read_link_gigabit() {
        let phy = autoneg_phy(ADVERTISE_ALL, ADVERTISE_ALL);
        phy.set(
            MII_BMSR,
            BMSR_LSTATUS | BMSR_ANEGCOMPLETE | BMSR_100FULL | BMSR_ESTATEN,
        );
        phy.set(MII_CTRL1000, CTRL1000_ADVERTISE_1000FULL);
        phy.set(MII_STAT1000, STAT1000_PARTNER_1000FULL);

        assert_eq!(
            read_link(&phy, 1),
            Ok(LinkState::Up {
                speed: LinkSpeed::Mbps1000,
                duplex: Duplex::Full
            })
        );
    }

    #[test]
    fn test_read_link_latched_low_status() {
        let mut phy = autoneg_phy(ADVERTISE_ALL, ADVERTISE_100HALF);
        phy.latched_low = true;

        assert!(read_link(&phy, 1).unwrap().is_up());
    }

    #[test]
    fn test_read_link_incomplete_autonegotiation() {
        let phy = autoneg_phy(ADVERTISE_ALL, ADVERTISE_ALL);
        phy.set(MII_BMSR, BMSR_LSTATUS);

        assert_eq!(read_link(&phy, 1), Ok(LinkState::Down));
    }

    #[test]
    fn test_read_link_isolated() {
        let phy = autoneg_phy(ADVERTISE_ALL, ADVERTISE_ALL);
        phy.set(MII_BMCR, BMCR_ANENABLE | BMCR_ISOLATE);

        assert_eq!(read_link(&phy, 1), Ok(LinkState::Down));
    }

    #[test]
    fn test_read_link_forced_mode() {
        let phy = FakePhy::new(0);
        phy.set(MII_BMSR, BMSR_LSTATUS);
        phy.set(MII_BMCR, BMCR_SPEED100);

        assert_eq!(
            read_link(&phy, 0),
            Ok(LinkState::Up {
                speed: LinkSpeed::Mbps100,
                duplex: Duplex::Half
            })
        );
    }

    #[test]
    fn test_configure_phy_advertises_all() {
        struct NoClock;
        impl Clock for NoClock {
            fn now_us(&self) -> u64 {
                0
            }
            fn delay_us(&self, _: u64) {}
        }

        let phy = FakePhy::new(2);
        configure_phy(&phy, 2, &NoClock, 1_000).unwrap();

        let advertise = phy.regs.borrow()[MII_ADVERTISE as usize];
        assert_eq!(advertise & ADVERTISE_ALL, ADVERTISE_ALL);
        assert_ne!(advertise & ADVERTISE_PAUSE, 0);
    }
}
