//! Port selection under conflict.
//!
//! The result is best effort: a port free at allocation time can be taken
//! before the service binds it.

use log::{debug, info, warn};
use serde::Serialize;

use crate::error::{DeployError, Result};
use crate::prompt::Confirmer;
use crate::system::PortProbe;

/// Inclusive bounds of the IANA dynamic range.
pub const EPHEMERAL_RANGE: std::ops::RangeInclusive<u16> = 49152..=65535;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum AllocationMethod {
    OperatorChoice,
    PreferenceList,
    RandomEphemeral,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PortSelection {
    pub requested_port: Option<u32>,
    pub resolved_port: u16,
    pub method: AllocationMethod,
    pub conflict_acknowledged: bool,
    /// Why earlier candidates were passed over.
    pub warnings: Vec<String>,
}

/// Inputs to one allocation.
pub struct PortRequest<'a> {
    pub preferred: &'a [u16],
    /// Raw operator value; out-of-range values are tolerated and reported.
    pub operator_choice: Option<u32>,
    pub ephemeral_attempts: u32,
}

pub struct PortAllocator<'a> {
    probe: &'a dyn PortProbe,
    confirmer: &'a dyn Confirmer,
    rng: fastrand::Rng,
}

impl<'a> PortAllocator<'a> {
    pub fn new(probe: &'a dyn PortProbe, confirmer: &'a dyn Confirmer) -> Self {
        Self {
            probe,
            confirmer,
            rng: fastrand::Rng::new(),
        }
    }

    /// Deterministic ephemeral picks for tests.
    pub fn with_seed(probe: &'a dyn PortProbe, confirmer: &'a dyn Confirmer, seed: u64) -> Self {
        Self {
            probe,
            confirmer,
            rng: fastrand::Rng::with_seed(seed),
        }
    }

    pub fn allocate(&mut self, request: &PortRequest<'_>) -> Result<PortSelection> {
        let mut warnings = Vec::new();

        if let Some(raw) = request.operator_choice {
            match self.operator_port(raw, &mut warnings)? {
                Some((port, acknowledged)) => {
                    info!("Using operator-selected port {port}");
                    return Ok(PortSelection {
                        requested_port: Some(raw),
                        resolved_port: port,
                        method: AllocationMethod::OperatorChoice,
                        conflict_acknowledged: acknowledged,
                        warnings,
                    });
                }
                None => debug!("Operator port {raw} rejected, falling back to automatic"),
            }
        }

        for &port in request.preferred {
            if port == 0 {
                continue;
            }
            if self.probe.in_use(port) {
                warnings.push(format!("preferred port {port} is in use"));
                continue;
            }
            info!("Selected preferred port {port}");
            return Ok(PortSelection {
                requested_port: request.operator_choice,
                resolved_port: port,
                method: AllocationMethod::PreferenceList,
                conflict_acknowledged: false,
                warnings,
            });
        }

        for attempt in 1..=request.ephemeral_attempts {
            let port = self.rng.u16(EPHEMERAL_RANGE);
            if self.probe.in_use(port) {
                debug!("ephemeral port {port} busy (attempt {attempt})");
                continue;
            }
            warnings.push(format!(
                "all preferred ports busy; using ephemeral port {port}"
            ));
            warn!("All preferred ports busy, selected ephemeral port {port}");
            return Ok(PortSelection {
                requested_port: request.operator_choice,
                resolved_port: port,
                method: AllocationMethod::RandomEphemeral,
                conflict_acknowledged: false,
                warnings,
            });
        }

        Err(DeployError::PortExhausted {
            attempts: request.ephemeral_attempts,
        })
    }

    /// `Some((port, acknowledged))` when the operator's choice stands.
    fn operator_port(&self, raw: u32, warnings: &mut Vec<String>) -> Result<Option<(u16, bool)>> {
        let port = match u16::try_from(raw) {
            Ok(p) if p != 0 => p,
            _ => {
                let err = DeployError::InvalidPort(raw);
                warn!("{err}");
                warnings.push(err.to_string());
                return Ok(None);
            }
        };

        if !self.probe.in_use(port) {
            return Ok(Some((port, false)));
        }

        let accepted = self.confirmer.confirm(
            &format!("Port {port} is already in use. Use it anyway?"),
            "The service will fail to bind until the other listener stops",
            false,
        )?;
        if accepted {
            warnings.push(format!("port {port} is in use; conflict acknowledged"));
            Ok(Some((port, true)))
        } else {
            warnings.push(DeployError::PortConflict(port).to_string());
            Ok(None)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::prompt::FixedConfirmer;
    use crate::system::fakes::FakePortProbe;

    fn request(preferred: &[u16], choice: Option<u32>) -> PortRequest<'_> {
        PortRequest {
            preferred,
            operator_choice: choice,
            ephemeral_attempts: 16,
        }
    }

    #[test]
    fn skips_busy_preferred_port() {
        let probe = FakePortProbe::with_busy(&[8085]);
        let confirm = FixedConfirmer::new(false);
        let sel = PortAllocator::with_seed(&probe, &confirm, 1)
            .allocate(&request(&[8085, 8090], None))
            .unwrap();
        assert_eq!(sel.resolved_port, 8090);
        assert_eq!(sel.method, AllocationMethod::PreferenceList);
        assert_eq!(sel.warnings.len(), 1);
    }

    #[test]
    fn all_busy_falls_back_to_ephemeral_range() {
        let probe = FakePortProbe::with_busy(&[8085, 8090]);
        let confirm = FixedConfirmer::new(false);
        let sel = PortAllocator::with_seed(&probe, &confirm, 42)
            .allocate(&request(&[8085, 8090], None))
            .unwrap();
        assert_eq!(sel.method, AllocationMethod::RandomEphemeral);
        assert!(EPHEMERAL_RANGE.contains(&sel.resolved_port));
    }

    #[test]
    fn exhaustion_is_an_error() {
        let busy: Vec<u16> = EPHEMERAL_RANGE.chain([8085]).collect();
        let probe = FakePortProbe::with_busy(&busy);
        let confirm = FixedConfirmer::new(false);
        let err = PortAllocator::with_seed(&probe, &confirm, 7)
            .allocate(&request(&[8085], None))
            .unwrap_err();
        assert!(matches!(err, DeployError::PortExhausted { attempts: 16 }));
    }

    #[test]
    fn free_operator_choice_wins_without_prompt() {
        let probe = FakePortProbe::default();
        let confirm = FixedConfirmer::new(false);
        let sel = PortAllocator::with_seed(&probe, &confirm, 1)
            .allocate(&request(&[8085], Some(9000)))
            .unwrap();
        assert_eq!(sel.resolved_port, 9000);
        assert_eq!(sel.method, AllocationMethod::OperatorChoice);
        assert!(!sel.conflict_acknowledged);
        assert!(confirm.asked().is_empty());
    }

    #[test]
    fn acknowledged_conflict_keeps_operator_choice() {
        let probe = FakePortProbe::with_busy(&[9000]);
        let confirm = FixedConfirmer::new(true);
        let sel = PortAllocator::with_seed(&probe, &confirm, 1)
            .allocate(&request(&[8085], Some(9000)))
            .unwrap();
        assert_eq!(sel.resolved_port, 9000);
        assert!(sel.conflict_acknowledged);
    }

    #[test]
    fn declined_conflict_falls_back_to_preferences() {
        let probe = FakePortProbe::with_busy(&[9000]);
        let confirm = FixedConfirmer::new(false);
        let sel = PortAllocator::with_seed(&probe, &confirm, 1)
            .allocate(&request(&[8085], Some(9000)))
            .unwrap();
        assert_eq!(sel.resolved_port, 8085);
        assert_eq!(sel.method, AllocationMethod::PreferenceList);
        assert_eq!(sel.requested_port, Some(9000));
        assert!(sel.warnings[0].contains("9000"));
    }

    #[test]
    fn out_of_range_choice_is_reported_and_ignored() {
        let probe = FakePortProbe::default();
        let confirm = FixedConfirmer::new(true);
        for bad in [0, 70000] {
            let sel = PortAllocator::with_seed(&probe, &confirm, 1)
                .allocate(&request(&[8085], Some(bad)))
                .unwrap();
            assert_eq!(sel.resolved_port, 8085);
            assert!(sel.warnings[0].contains("invalid port"));
        }
        assert!(confirm.asked().is_empty());
    }
}
