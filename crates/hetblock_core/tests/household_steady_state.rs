mod common;

use common::{
    household, household_inputs, household_uc, household_uc_inputs, two_shock_saver,
    two_shock_saver_inputs, Calibration, N_A, N_E,
};
use hetblock_core::markov::{stationary, StationarySettings};
use hetblock_core::{SteadyStateSettings, StateArray, Variables};

fn settings() -> SteadyStateSettings {
    SteadyStateSettings {
        forward_max_iterations: 100_000,
        ..SteadyStateSettings::default()
    }
}

#[test]
fn household_distribution_is_a_stationary_probability_measure() {
    let cal = Calibration::default();
    let block = household();
    let ss = block
        .steady_state(&household_inputs(&cal), &settings())
        .expect("steady state");

    let d = ss.distribution();
    assert_eq!(d.shape(), &[N_E, N_A]);
    assert!((d.sum() - 1.0).abs() < 1e-10);
    assert!(d.as_slice().iter().all(|&p| p >= 0.0));

    let operator = block.steady_state_operator(&ss).expect("operator");
    let next = operator.forward_step(d).expect("forward step");
    assert!(next.max_abs_diff(d).expect("diff") < 1e-9);
}

#[test]
fn household_aggregates_satisfy_the_budget_identity() {
    let cal = Calibration::default();
    let ss = household()
        .steady_state(&household_inputs(&cal), &settings())
        .expect("steady state");
    let assets = ss.aggregate("a").expect("A");
    let consumption = ss.aggregate("c").expect("C");
    assert!(assets > 0.0);

    // Income has mean one, so C = r A + w.
    let gap = consumption - (cal.r * assets + cal.w);
    assert!(gap.abs() < 1e-5, "budget identity off by {gap:e}");

    // Assets held today match the savings chosen by the same population.
    let a_grid = ss.inputs().array("a_grid").expect("a_grid");
    let held = StateArray::from_fn(&[N_E, N_A], |idx| a_grid[idx[1]]);
    let gap = ss.distribution().dot(&held).expect("dot") - assets;
    assert!(gap.abs() < 1e-5, "asset holdings off by {gap:e}");

    let vars = ss.to_variables();
    assert_eq!(vars.scalar("A").expect("A"), assets);
    assert_eq!(vars.scalar("C").expect("C"), consumption);
}

/// Aggregate assets of the default calibration, from an independent
/// evaluation of the same grids, EGM step and lottery.
const REFERENCE_ASSETS: f64 = 2.855_136_14;

#[test]
fn household_assets_match_the_recorded_reference() {
    let cal = Calibration::default();
    let ss = household()
        .steady_state(&household_inputs(&cal), &settings())
        .expect("steady state");
    let a_grid = ss.inputs().array("a_grid").expect("a_grid");
    let held = StateArray::from_fn(&[N_E, N_A], |idx| a_grid[idx[1]]);
    let assets = ss.distribution().dot(&held).expect("dot");
    // Stopping tolerances of both iterations move A by about 1e-7.
    assert!(
        (assets - REFERENCE_ASSETS).abs() < 1e-6,
        "aggregate assets {assets} vs reference {REFERENCE_ASSETS}"
    );
    assert!((ss.aggregate("a").expect("A") - REFERENCE_ASSETS).abs() < 1e-6);
}

#[test]
fn equivalent_formulations_clear_the_asset_market_identically() {
    let cal = Calibration::default();
    let ss_va = household()
        .steady_state(&household_inputs(&cal), &settings())
        .expect("Va steady state");
    let ss_uc = household_uc()
        .steady_state(&household_uc_inputs(&cal), &settings())
        .expect("uc steady state");

    // Residual against a unit bond supply.
    let asset_mkt_va = ss_va.aggregate("a").expect("A") - 1.0;
    let asset_mkt_uc = ss_uc.aggregate("a").expect("A") - 1.0;
    assert!(
        (asset_mkt_va - asset_mkt_uc).abs() < 1e-8,
        "{asset_mkt_va} vs {asset_mkt_uc}"
    );
    let c_gap = ss_va.aggregate("c").expect("C") - ss_uc.aggregate("c").expect("C");
    assert!(c_gap.abs() < 1e-8);
}

#[test]
fn policy_ss_restarted_from_its_fixed_point_stops_at_the_first_check() {
    let cal = Calibration::default();
    let block = household();
    let config = settings();
    let first = block
        .policy_ss(&household_inputs(&cal), &config)
        .expect("policy steady state");
    assert!(first.residual < config.backward_tol);

    let va = first.outputs.array("Va").expect("Va").clone();
    let restarted: Variables = household_inputs(&cal).with("Va", va);
    let second = block.policy_ss(&restarted, &config).expect("restart");
    assert!(second.iterations <= 1 + config.check_interval);
    let a0 = first.outputs.array("a").expect("a");
    let a1 = second.outputs.array("a").expect("a");
    assert!(a0.max_abs_diff(a1).expect("diff") < 1e-7);
}

#[test]
fn distribution_seed_is_honored() {
    let cal = Calibration::default();
    let block = household();
    let ss = block
        .steady_state(&household_inputs(&cal), &settings())
        .expect("steady state");

    let seeded = household_inputs(&cal).with("D", ss.distribution().clone());
    let again = block.steady_state(&seeded, &settings()).expect("seeded");
    assert!(again.forward_iterations() <= ss.forward_iterations());
    let gap = again.aggregate("a").expect("A") - ss.aggregate("a").expect("A");
    assert!(gap.abs() < 1e-7);
}

#[test]
fn two_exogenous_processes_keep_their_stationary_marginals() {
    let inputs = two_shock_saver_inputs();
    let ss = two_shock_saver()
        .steady_state(&inputs, &settings())
        .expect("steady state");
    let d = ss.distribution();
    assert_eq!(d.shape(), &[2, 3, 30]);
    assert!((d.sum() - 1.0).abs() < 1e-12);
    assert!(d.as_slice().iter().all(|&p| p >= 0.0));

    let pi = stationary(inputs.matrix("Pi").expect("Pi"), None, StationarySettings::default())
        .expect("Pi stationary");
    let z = stationary(inputs.matrix("Z").expect("Z"), None, StationarySettings::default())
        .expect("Z stationary");
    for e in 0..2 {
        for k in 0..3 {
            let marginal: f64 = (0..30).map(|a| d.at(&[e, k, a])).sum();
            let expected = pi[e] * z[k];
            assert!((marginal - expected).abs() < 1e-9, "[{e}, {k}]: {marginal} vs {expected}");
        }
    }

    let a_grid = inputs.array("a_grid").expect("a_grid");
    let held = StateArray::from_fn(&[2, 3, 30], |idx| a_grid[idx[2]]);
    let gap = d.dot(&held).expect("dot") - ss.aggregate("a").expect("A");
    assert!(gap.abs() < 1e-8, "asset holdings off by {gap:e}");
}
