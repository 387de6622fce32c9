//! Level thresholds and the protective actions of each level.

use guardrail_core::{EmergencyAction, EmergencyLevel, EmergencySettings};

/// Level a normalised pressure reading maps to.
pub fn level_for(pressure: f64, settings: &EmergencySettings) -> EmergencyLevel {
    if pressure >= settings.panic_threshold {
        EmergencyLevel::Panic
    } else if pressure >= settings.emergency_threshold {
        EmergencyLevel::Emergency
    } else if pressure >= settings.warning_threshold {
        EmergencyLevel::Warning
    } else {
        EmergencyLevel::Normal
    }
}

/// One level more severe, saturating at PANIC.
pub fn escalate(level: EmergencyLevel) -> EmergencyLevel {
    match level {
        EmergencyLevel::Normal => EmergencyLevel::Warning,
        EmergencyLevel::Warning => EmergencyLevel::Emergency,
        EmergencyLevel::Emergency | EmergencyLevel::Panic => EmergencyLevel::Panic,
    }
}

/// One level less severe, saturating at NORMAL.
pub fn deescalate(level: EmergencyLevel) -> EmergencyLevel {
    match level {
        EmergencyLevel::Panic => EmergencyLevel::Emergency,
        EmergencyLevel::Emergency => EmergencyLevel::Warning,
        EmergencyLevel::Warning | EmergencyLevel::Normal => EmergencyLevel::Normal,
    }
}

/// Actions active at `level`. Each level includes those of the levels below.
pub fn actions_for(level: EmergencyLevel, settings: &EmergencySettings) -> Vec<EmergencyAction> {
    let mut actions = Vec::new();
    if level >= EmergencyLevel::Warning {
        actions.push(EmergencyAction::HeightenedMonitoring);
    }
    if level >= EmergencyLevel::Emergency {
        actions.push(EmergencyAction::ForceBreakersOpen);
        actions.push(EmergencyAction::RateLimiting);
    }
    if level >= EmergencyLevel::Panic {
        actions.push(EmergencyAction::CutLimits {
            factor: settings.panic_limit_factor,
        });
        actions.push(EmergencyAction::ThrottleIngestion {
            percent: settings.ingestion_throttle_percent,
        });
        actions.push(EmergencyAction::DisableNonCriticalQueries);
        actions.push(EmergencyAction::ForceGc);
        actions.push(EmergencyAction::AlertAllChannels);
    }
    actions
}
