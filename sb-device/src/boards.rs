use serde::Serialize;

#[derive(Clone, Copy, Debug, Serialize)]
pub struct BoardProfile {
    pub fqbn: &'static str,
    pub display_name: &'static str,
}

// The supported target catalog is fixed; it is not discovered from the
// toolchain, so listings are identical on every host.
pub const BOARD_CATALOG: &[BoardProfile] = &[
    BoardProfile {
        fqbn: "arduino:avr:nano",
        display_name: "Arduino Nano",
    },
    BoardProfile {
        fqbn: "arduino:avr:uno",
        display_name: "Arduino Uno",
    },
    BoardProfile {
        fqbn: "arduino:avr:mega",
        display_name: "Arduino Mega 2560",
    },
    BoardProfile {
        fqbn: "esp32:esp32:esp32",
        display_name: "ESP32 Dev Module",
    },
    BoardProfile {
        fqbn: "esp32:esp32:esp32s3",
        display_name: "ESP32-S3 Module",
    },
    BoardProfile {
        fqbn: "esp8266:esp8266:nodemcuv2",
        display_name: "ESP8266 NodeMCU",
    },
];

pub fn display_name(fqbn: &str) -> Option<&'static str> {
    BOARD_CATALOG
        .iter()
        .find(|profile| profile.fqbn == fqbn)
        .map(|profile| profile.display_name)
}
