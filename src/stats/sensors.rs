// src/stats/sensors.rs
//! Device sensors
//!
//! The mining engine only sees the [`DeviceSensors`] trait. The default
//! implementation reads CPU load and component temperatures through
//! `sysinfo`, falling back to the kernel's thermal zones, and reads the
//! battery from `/sys/class/power_supply`.

use std::fs;
use std::path::{Path, PathBuf};
use sysinfo::{Components, System};

/// Battery reading
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BatteryStatus {
    /// Charge in percent
    pub level: u8,
    /// True while plugged in (charging or full)
    pub charging: bool,
    /// Battery temperature in Celsius, when reported
    pub temperature: Option<f32>,
}

/// One round of sensor readings
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct DeviceSample {
    /// Hottest CPU/SoC temperature in Celsius
    pub temperature: Option<f32>,
    /// Average CPU usage in percent
    pub cpu_usage: f32,
    /// `None` on devices without a battery
    pub battery: Option<BatteryStatus>,
}

/// Source of device telemetry
pub trait DeviceSensors: Send {
    /// Takes a fresh reading
    fn sample(&mut self) -> DeviceSample;
}

/// Sensors backed by `sysinfo` and sysfs
pub struct SystemSensors {
    system: System,
    components: Components,
    thermal_root: PathBuf,
    power_supply_root: PathBuf,
}

impl Default for SystemSensors {
    fn default() -> Self {
        Self::new()
    }
}

impl SystemSensors {
    pub fn new() -> Self {
        Self::with_roots("/sys/class/thermal", "/sys/class/power_supply")
    }

    /// Reads sysfs data from custom roots
    pub fn with_roots(thermal_root: impl Into<PathBuf>, power_supply_root: impl Into<PathBuf>) -> Self {
        SystemSensors {
            system: System::new(),
            components: Components::new_with_refreshed_list(),
            thermal_root: thermal_root.into(),
            power_supply_root: power_supply_root.into(),
        }
    }

    fn cpu_usage(&mut self) -> f32 {
        self.system.refresh_cpu_all();
        let cpus = self.system.cpus();
        if cpus.is_empty() {
            return 0.0;
        }
        cpus.iter().map(|c| c.cpu_usage()).sum::<f32>() / cpus.len() as f32
    }

    fn temperature(&mut self) -> Option<f32> {
        self.components.refresh(true);
        let cpu = self
            .components
            .iter()
            .filter(|c| {
                let label = c.label().to_lowercase();
                label.contains("cpu") || label.contains("soc") || label.contains("package")
            })
            .filter_map(|c| c.temperature())
            .filter(|t| plausible(*t))
            .reduce(f32::max);

        cpu.or_else(|| read_thermal_zones(&self.thermal_root))
    }
}

impl DeviceSensors for SystemSensors {
    fn sample(&mut self) -> DeviceSample {
        DeviceSample {
            temperature: self.temperature(),
            cpu_usage: self.cpu_usage(),
            battery: read_battery(&self.power_supply_root),
        }
    }
}

fn plausible(celsius: f32) -> bool {
    celsius.is_finite() && celsius > -40.0 && celsius < 150.0
}

fn read_trimmed(path: &Path) -> Option<String> {
    fs::read_to_string(path).ok().map(|s| s.trim().to_string())
}

/// Hottest `thermal_zone*/temp` under `root`
///
/// Zones report millidegrees; a few vendors report whole degrees.
pub fn read_thermal_zones(root: &Path) -> Option<f32> {
    fs::read_dir(root)
        .ok()?
        .filter_map(Result::ok)
        .filter(|e| e.file_name().to_string_lossy().starts_with("thermal_zone"))
        .filter_map(|e| read_trimmed(&e.path().join("temp")))
        .filter_map(|raw| raw.parse::<i64>().ok())
        .map(|raw| {
            if raw.abs() >= 1000 {
                raw as f32 / 1000.0
            } else {
                raw as f32
            }
        })
        .filter(|t| plausible(*t))
        .reduce(f32::max)
}

/// First supply of type `Battery` under `root`
///
/// `temp` is in tenths of a degree, as Android kernels expose it.
pub fn read_battery(root: &Path) -> Option<BatteryStatus> {
    fs::read_dir(root)
        .ok()?
        .filter_map(Result::ok)
        .map(|e| e.path())
        .find(|dir| read_trimmed(&dir.join("type")).as_deref() == Some("Battery"))
        .and_then(|dir| {
            let level = read_trimmed(&dir.join("capacity"))?.parse::<u8>().ok()?.min(100);
            let charging = matches!(
                read_trimmed(&dir.join("status")).as_deref(),
                Some("Charging") | Some("Full")
            );
            let temperature = read_trimmed(&dir.join("temp"))
                .and_then(|t| t.parse::<f32>().ok())
                .map(|t| t / 10.0)
                .filter(|t| plausible(*t));
            Some(BatteryStatus {
                level,
                charging,
                temperature,
            })
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write(path: PathBuf, contents: &str) {
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, contents).unwrap();
    }

    #[test]
    fn reads_hottest_thermal_zone() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        write(root.join("thermal_zone0/temp"), "41500\n");
        write(root.join("thermal_zone1/temp"), "67250\n");
        write(root.join("thermal_zone2/temp"), "garbage\n");
        write(root.join("cooling_device0/temp"), "99000\n");

        assert_eq!(read_thermal_zones(root), Some(67.25));
    }

    #[test]
    fn reads_battery_supply() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        write(root.join("usb/type"), "USB\n");
        write(root.join("battery/type"), "Battery\n");
        write(root.join("battery/capacity"), "18\n");
        write(root.join("battery/status"), "Discharging\n");
        write(root.join("battery/temp"), "452\n");

        let battery = read_battery(root).unwrap();
        assert_eq!(battery.level, 18);
        assert!(!battery.charging);
        assert_eq!(battery.temperature, Some(45.2));
    }

    #[test]
    fn missing_sysfs_yields_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        assert_eq!(read_thermal_zones(root), None);
        assert_eq!(read_battery(root), None);
        assert_eq!(read_battery(&root.join("absent")), None);
    }
}
