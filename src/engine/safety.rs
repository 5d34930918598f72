// src/engine/safety.rs
//! Thermal and battery protection rules
//!
//! [`SafetyMonitor`] is pure: it turns one [`DeviceSample`] plus the clock
//! into hold/release events, and the orchestrator applies them to the
//! resource controller. The rules keep separate state, but the thermal rule
//! only trips while the caller reports active mining, so an outstanding
//! battery hold keeps it from tripping.

use crate::config::ResourceConfig;
use crate::stats::DeviceSample;
use std::time::{Duration, Instant};

/// Thresholds for both rules
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SafetyLimits {
    pub thermal_protection: bool,
    pub max_temperature: f32,
    pub thermal_cooldown: Duration,
    pub battery_protection: bool,
    pub low_battery_threshold: u8,
    pub battery_hysteresis: u8,
    pub battery_max_temperature: f32,
}

impl From<&ResourceConfig> for SafetyLimits {
    fn from(r: &ResourceConfig) -> Self {
        SafetyLimits {
            thermal_protection: r.thermal_protection,
            max_temperature: r.max_temperature,
            thermal_cooldown: Duration::from_millis(r.thermal_cooldown_ms),
            battery_protection: r.battery_protection,
            low_battery_threshold: r.low_battery_threshold,
            battery_hysteresis: r.battery_hysteresis,
            battery_max_temperature: r.battery_max_temperature,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SafetyEvent {
    ThermalTripped,
    ThermalCooled,
    BatteryHeld,
    BatteryReleased,
}

/// Tracks both protection rules across monitor ticks
#[derive(Debug)]
pub struct SafetyMonitor {
    limits: SafetyLimits,
    throttled_until: Option<Instant>,
    battery_hold: bool,
}

impl SafetyMonitor {
    pub fn new(limits: SafetyLimits) -> Self {
        SafetyMonitor {
            limits,
            throttled_until: None,
            battery_hold: false,
        }
    }

    pub fn limits(&self) -> &SafetyLimits {
        &self.limits
    }

    pub fn thermal_hold(&self) -> bool {
        self.throttled_until.is_some()
    }

    pub fn battery_hold(&self) -> bool {
        self.battery_hold
    }

    /// Applies both rules to `sample`
    ///
    /// # Arguments
    /// * `sample` - Latest sensor reading
    /// * `now` - Clock used for the cooldown deadline
    /// * `mining` - The thermal rule only trips while actually hashing
    ///
    /// # Returns
    /// Events for every hold that changed, thermal first
    pub fn evaluate(&mut self, sample: &DeviceSample, now: Instant, mining: bool) -> Vec<SafetyEvent> {
        let mut events = Vec::new();
        if let Some(event) = self.evaluate_thermal(sample, now, mining) {
            events.push(event);
        }
        if let Some(event) = self.evaluate_battery(sample) {
            events.push(event);
        }
        events
    }

    fn evaluate_thermal(&mut self, sample: &DeviceSample, now: Instant, mining: bool) -> Option<SafetyEvent> {
        match self.throttled_until {
            // the next tick re-trips if the device is still hot
            Some(until) if now >= until => {
                self.throttled_until = None;
                Some(SafetyEvent::ThermalCooled)
            }
            Some(_) => None,
            None => {
                let hot = sample
                    .temperature
                    .is_some_and(|t| t > self.limits.max_temperature);
                if self.limits.thermal_protection && mining && hot {
                    self.throttled_until = Some(now + self.limits.thermal_cooldown);
                    Some(SafetyEvent::ThermalTripped)
                } else {
                    None
                }
            }
        }
    }

    fn evaluate_battery(&mut self, sample: &DeviceSample) -> Option<SafetyEvent> {
        let battery = match sample.battery {
            Some(battery) if self.limits.battery_protection => battery,
            _ => {
                return if self.battery_hold {
                    self.battery_hold = false;
                    Some(SafetyEvent::BatteryReleased)
                } else {
                    None
                };
            }
        };

        let hot = battery
            .temperature
            .is_some_and(|t| t > self.limits.battery_max_temperature);

        if !self.battery_hold {
            let low = !battery.charging && battery.level < self.limits.low_battery_threshold;
            if low || hot {
                self.battery_hold = true;
                return Some(SafetyEvent::BatteryHeld);
            }
            return None;
        }

        let resume_level = self
            .limits
            .low_battery_threshold
            .saturating_add(self.limits.battery_hysteresis);
        if battery.level >= resume_level && !hot {
            self.battery_hold = false;
            return Some(SafetyEvent::BatteryReleased);
        }
        None
    }
}
