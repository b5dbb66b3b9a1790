//! The default calibration stage catalogue.
//!
//! | stage | active when | needs | role |
//! |-------|-------------|-------|------|
//! | `tpc_calib` | TPC | | normal |
//! | `trd_calib` | TRD | `tpc_calib` | normal |
//! | `t0_calib` | T0 | | normal |
//! | `mean_vertex` | ITSSPD | | normal |
//! | `sdd_align` | `ALIEN_JDL_CPASS0_SDD_CALIBRATION` > 0 | | normal |
//! | `tof_calib` | TOF | `tpc_calib` | terminal-mutating |
//!
//! Every stage except `sdd_align` can be switched off with its
//! `CALIBTRAIN_DISABLE_*` variable.

use calibtrain_types::{Result, Subsystem};

use crate::registry::{StageDescriptor, StageRegistry};
use crate::validation::validate_registry_or_raise;

pub const TPC_CALIB: &str = "tpc_calib";
pub const TRD_CALIB: &str = "trd_calib";
pub const T0_CALIB: &str = "t0_calib";
pub const MEAN_VERTEX: &str = "mean_vertex";
pub const SDD_ALIGN: &str = "sdd_align";
pub const TOF_CALIB: &str = "tof_calib";

/// Fixed cleanup stage run by the executor after every stream.
pub const CLEAN_GEOM: &str = "clean_geom";

pub const SDD_SWITCH: &str = "ALIEN_JDL_CPASS0_SDD_CALIBRATION";
pub const DISABLE_TPC: &str = "CALIBTRAIN_DISABLE_TPC";
pub const DISABLE_TRD: &str = "CALIBTRAIN_DISABLE_TRD";
pub const DISABLE_T0: &str = "CALIBTRAIN_DISABLE_T0";
pub const DISABLE_MEAN_VERTEX: &str = "CALIBTRAIN_DISABLE_MEAN_VERTEX";
pub const DISABLE_TOF: &str = "CALIBTRAIN_DISABLE_TOF";

/// Descriptors of the default catalogue, in registration order.
pub fn default_stages() -> Vec<StageDescriptor> {
    vec![
        StageDescriptor::when_present(TPC_CALIB, Subsystem::Tpc).opt_out(DISABLE_TPC),
        StageDescriptor::when_present(TRD_CALIB, Subsystem::Trd)
            .requires(TPC_CALIB)
            .opt_out(DISABLE_TRD),
        StageDescriptor::when_present(T0_CALIB, Subsystem::T0).opt_out(DISABLE_T0),
        StageDescriptor::when_present(MEAN_VERTEX, Subsystem::ItsSpd)
            .opt_out(DISABLE_MEAN_VERTEX),
        StageDescriptor::always(SDD_ALIGN).opt_in(SDD_SWITCH),
        // Modifies the event record, so it must see it after everyone else.
        StageDescriptor::when_present(TOF_CALIB, Subsystem::Tof)
            .requires(TPC_CALIB)
            .terminal_mutating()
            .opt_out(DISABLE_TOF),
    ]
}

/// Build and validate the default registry.
pub fn default_registry() -> Result<StageRegistry> {
    let mut registry = StageRegistry::new();
    for stage in default_stages() {
        registry.register(stage)?;
    }
    validate_registry_or_raise(&registry)?;
    Ok(registry)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::StageRole;
    use calibtrain_types::{CapabilityMask, Overrides, RunContext};

    fn ctx(subsystems: &[Subsystem]) -> RunContext {
        RunContext::new(104892, subsystems.iter().copied().collect())
    }

    #[test]
    fn default_registry_is_valid() {
        let reg = default_registry().unwrap();
        let names: Vec<_> = reg.iter().map(|d| d.name()).collect();
        assert_eq!(
            names,
            vec![TPC_CALIB, TRD_CALIB, T0_CALIB, MEAN_VERTEX, SDD_ALIGN, TOF_CALIB]
        );
        assert_eq!(reg.terminal().unwrap().name(), TOF_CALIB);
        assert_eq!(reg.get(TOF_CALIB).unwrap().role(), StageRole::TerminalMutating);
        assert_eq!(reg.switch_names().len(), 6);
    }

    #[test]
    fn full_detector_set_runs_everything_but_sdd() {
        let reg = default_registry().unwrap();
        let plan = reg.plan(&ctx(&[
            Subsystem::ItsSpd,
            Subsystem::Tpc,
            Subsystem::Trd,
            Subsystem::Tof,
            Subsystem::T0,
        ]));
        assert_eq!(
            plan.names(),
            vec![TPC_CALIB, TRD_CALIB, T0_CALIB, MEAN_VERTEX, TOF_CALIB]
        );
    }

    #[test]
    fn sdd_switch_inserts_before_tof() {
        let reg = default_registry().unwrap();
        let context = ctx(&[Subsystem::Tpc, Subsystem::Tof])
            .with_overrides(Overrides::new().with(SDD_SWITCH, "1"));
        assert_eq!(
            reg.plan(&context).names(),
            vec![TPC_CALIB, SDD_ALIGN, TOF_CALIB]
        );
    }

    #[test]
    fn trd_and_tof_need_tpc() {
        let reg = default_registry().unwrap();
        let plan = reg.plan(&ctx(&[Subsystem::Trd, Subsystem::Tof, Subsystem::T0]));
        assert_eq!(plan.names(), vec![T0_CALIB]);
    }

    #[test]
    fn disabling_tpc_takes_dependents_with_it() {
        let reg = default_registry().unwrap();
        let context = ctx(&[Subsystem::Tpc, Subsystem::Trd, Subsystem::Tof, Subsystem::T0])
            .with_overrides(Overrides::new().with(DISABLE_TPC, "1"));
        assert_eq!(reg.plan(&context).names(), vec![T0_CALIB]);
    }

    #[test]
    fn empty_mask_gives_empty_plan() {
        let reg = default_registry().unwrap();
        let plan = reg.plan(&RunContext::new(1, CapabilityMask::empty()));
        assert!(plan.is_empty());
        assert_eq!(plan.decisions.len(), 6);
    }
}
