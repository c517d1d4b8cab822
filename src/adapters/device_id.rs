//! Per-board and per-boot identity seeds.
//!
//! The MQTT client id and the diagnostics session id both need to differ
//! between boards and between boots.  The factory MAC (eFuse) gives the
//! per-board part; the hardware RNG gives the per-boot part.

/// Full 6-byte MAC address.
pub type MacAddress = [u8; 6];

/// Read the factory MAC address from eFuse.
#[cfg(feature = "espidf")]
pub fn read_mac() -> MacAddress {
    let mut mac: MacAddress = [0u8; 6];
    // SAFETY: writes exactly 6 bytes into `mac`.
    unsafe {
        esp_idf_svc::sys::esp_efuse_mac_get_default(mac.as_mut_ptr());
    }
    mac
}

/// Simulation: returns a deterministic fake MAC.
#[cfg(not(feature = "espidf"))]
pub fn read_mac() -> MacAddress {
    [0xDE, 0xAD, 0xBE, 0xEF, 0xCA, 0xFE]
}

/// 32 random bits.  Hardware RNG on ESP32 (true random once the radio or
/// bootloader entropy source has run).
#[cfg(feature = "espidf")]
pub fn random_u32() -> u32 {
    // SAFETY: reads the RNG register.
    unsafe { esp_idf_svc::sys::esp_random() }
}

/// Simulation: wall-clock nanoseconds, good enough to tell runs apart.
#[cfg(not(feature = "espidf"))]
pub fn random_u32() -> u32 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.subsec_nanos() ^ (d.as_secs() as u32))
        .unwrap_or(0)
}

/// FNV-1a over the MAC, folded to 32 bits.
pub fn mac_seed(mac: &MacAddress) -> u32 {
    mac.iter().fold(0x811C_9DC5_u32, |h, &b| {
        (h ^ u32::from(b)).wrapping_mul(0x0100_0193)
    })
}

/// Seed for the MQTT client id: stable per board, varied per boot.
pub fn client_id_seed() -> u32 {
    mac_seed(&read_mac()) ^ random_u32()
}
