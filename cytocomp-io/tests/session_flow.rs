//! Session and background worker behaviour end to end.

use approx::assert_abs_diff_eq;
use cytocomp_core::{AxisRanges, DensityGrid, DensityQuery, GateRect};
use cytocomp_io::{
    save_compensation, load_compensation, ApplyPhase, ApplyStatus, PipelineConfig, Response,
    Session,
};
use std::io::Write;
use std::time::Duration;
use tempfile::NamedTempFile;

const WAIT: Duration = Duration::from_secs(30);

/// Two 16-bit little-endian integer channels named A and B.
fn fcs_bytes(events: &[(u16, u16)], extra: &str) -> Vec<u8> {
    let text = format!(
        "|$TOT|{}|$PAR|2|$DATATYPE|I|$BYTEORD|1,2|$P1N|A|$P1B|16|$P2N|B|$P2B|16|{extra}",
        events.len()
    );
    let text_end = 58 + text.len() - 1;
    let data_start = text_end + 1;
    let data_end = data_start + events.len() * 4 - 1;
    let mut out = format!(
        "FCS3.1    {:>8}{:>8}{:>8}{:>8}{:>8}{:>8}",
        58, text_end, data_start, data_end, 0, 0
    )
    .into_bytes();
    out.extend_from_slice(text.as_bytes());
    for (a, b) in events {
        out.extend_from_slice(&a.to_le_bytes());
        out.extend_from_slice(&b.to_le_bytes());
    }
    out
}

fn ramp(n: u16) -> Vec<(u16, u16)> {
    (0..n).map(|i| (i, 1000 + i)).collect()
}

fn full_range_query() -> DensityQuery {
    DensityQuery::new(0, 1)
        .with_ranges(AxisRanges {
            x_min: 0.0,
            x_max: 2000.0,
            y_min: 0.0,
            y_max: 2000.0,
        })
        .with_grid(16, 16)
}

fn assert_grid_invariants(grid: &DensityGrid) {
    let sum: u64 = grid.counts.iter().map(|&c| u64::from(c)).sum();
    assert_eq!(sum, grid.n_passed);
    assert!(grid.n_passed <= grid.total);
    assert!(grid.counts.iter().all(|&c| c <= grid.max_count));
}

#[test]
fn test_apply_then_density() {
    let mut session = Session::new(PipelineConfig::default().with_chunk_size(16)).unwrap();
    session.load_bytes(fcs_bytes(&[(100, 1000), (200, 500)], "")).unwrap();
    session.matrix_mut().set_coeff(0, 1, 0.1).unwrap();

    let preview = session.preview_corrected().unwrap();
    assert_abs_diff_eq!(f64::from(preview.column(1).unwrap()[0]), 990.0, epsilon = 1e-3);
    assert_abs_diff_eq!(f64::from(preview.column(1).unwrap()[1]), 480.0, epsilon = 1e-3);

    session.start_apply().unwrap();
    assert_eq!(session.wait_for_apply(WAIT).unwrap(), ApplyStatus::Done);
    assert!(session.is_full_up_to_date());
    assert_eq!(session.apply_job().phase, Some(ApplyPhase::Finalizing));
    assert_eq!(session.full_revision(), Some(session.matrix().revision()));

    let query = full_range_query();
    let id = session.request_density(0, query.clone()).unwrap();
    assert!(id.is_some());
    // Same query while pending is not re-issued.
    assert_eq!(session.request_density(0, query.clone()).unwrap(), None);

    let grid = session.wait_for_density(0, WAIT).unwrap().cloned().unwrap();
    assert_eq!(grid.total, 2);
    assert_eq!(grid.n_passed, 2);
    assert_grid_invariants(&grid);
    assert!(session.density(0, &query).is_some());
    // Same query once cached is not re-issued either.
    assert_eq!(session.request_density(0, query).unwrap(), None);
}

#[test]
fn test_edits_make_full_result_stale() {
    let mut session = Session::new(PipelineConfig::default()).unwrap();
    session.load_bytes(fcs_bytes(&ramp(50), "")).unwrap();
    session.start_apply().unwrap();
    assert_eq!(session.wait_for_apply(WAIT).unwrap(), ApplyStatus::Done);
    assert!(session.is_full_up_to_date());

    session.matrix_mut().set_coeff(1, 0, 0.05).unwrap();
    assert!(!session.is_full_up_to_date());
    session.matrix_mut().reset_all();
    // Undoing the edit is still a new revision.
    assert!(!session.is_full_up_to_date());

    session.start_apply().unwrap();
    assert_eq!(session.wait_for_apply(WAIT).unwrap(), ApplyStatus::Done);
    assert!(session.is_full_up_to_date());
}

#[test]
fn test_stale_density_response_is_dropped() {
    let mut session = Session::new(PipelineConfig::default()).unwrap();
    session.load_bytes(fcs_bytes(&ramp(20), "")).unwrap();
    session.start_apply().unwrap();
    assert_eq!(session.wait_for_apply(WAIT).unwrap(), ApplyStatus::Done);

    let first = session.request_density(3, full_range_query()).unwrap().unwrap();
    let second_query = full_range_query().with_grid(32, 32);
    let second = session.request_density(3, second_query.clone()).unwrap().unwrap();
    assert_ne!(first, second);

    // A response for the superseded request must not touch the cache.
    session.handle_response(Response::DensityResult {
        slot: 3,
        request_id: first,
        key: full_range_query().key(),
        grid: Box::new(DensityGrid {
            width: 16,
            height: 16,
            counts: vec![0; 256],
            max_count: 0,
            n_passed: 0,
            total: 20,
        }),
    });
    assert!(session.cached_density(3).is_none());
    assert!(session.density_pending(3));

    let grid = session.wait_for_density(3, WAIT).unwrap().cloned().unwrap();
    assert_eq!((grid.width, grid.height), (32, 32));
    assert_eq!(session.cached_density(3).unwrap().key, second_query.key());
}

#[test]
fn test_density_before_apply_reports_no_full_data() {
    let mut session = Session::new(PipelineConfig::default()).unwrap();
    session.load_bytes(fcs_bytes(&ramp(4), "")).unwrap();
    session.request_density(0, full_range_query()).unwrap();
    assert!(session.wait_for_density(0, WAIT).unwrap().is_none());
    assert!(session.density_error(0).unwrap().contains("no full dataset"));
}

#[test]
fn test_gated_density_counts_only_inside_events() {
    let mut session = Session::new(PipelineConfig::default()).unwrap();
    session.load_bytes(fcs_bytes(&ramp(100), "")).unwrap();
    session.start_apply().unwrap();
    assert_eq!(session.wait_for_apply(WAIT).unwrap(), ApplyStatus::Done);

    session
        .gates_mut()
        .add(GateRect::new(0, 1, (10.0, 19.0), (0.0, 5000.0)));
    let query = full_range_query().with_gates(session.selected_chain());
    session.request_density(1, query).unwrap();
    let grid = session.wait_for_density(1, WAIT).unwrap().cloned().unwrap();
    assert_eq!(grid.n_passed, 10);
    assert_eq!(grid.total, 100);
    assert_grid_invariants(&grid);
}

#[test]
fn test_cancel_is_terminal_and_drops_full_result() {
    let events: Vec<(u16, u16)> = (0..2_000_000u32)
        .map(|i| ((i % 60_000) as u16, (i % 30_000) as u16))
        .collect();
    let mut session = Session::new(PipelineConfig::default().with_chunk_size(4096)).unwrap();
    session.load_bytes(fcs_bytes(&events, "")).unwrap();
    session.start_apply().unwrap();
    assert_eq!(session.wait_for_apply(WAIT).unwrap(), ApplyStatus::Done);
    assert_eq!(session.full_revision(), Some(0));

    session.request_density(0, full_range_query()).unwrap();
    assert!(session.wait_for_density(0, WAIT).unwrap().is_some());

    session.matrix_mut().set_coeff(0, 1, 0.2).unwrap();
    session.start_apply().unwrap();
    // The token flips before the worker can get through the events.
    session.cancel_apply().unwrap();
    assert_eq!(session.wait_for_apply(WAIT).unwrap(), ApplyStatus::Cancelled);
    assert!(!session.is_full_up_to_date());
    assert_eq!(session.full_revision(), None);
    assert!(session.cached_density(0).is_none());

    // The worker no longer serves the earlier result either.
    session.request_density(0, full_range_query()).unwrap();
    assert!(session.wait_for_density(0, WAIT).unwrap().is_none());
    assert!(session.density_error(0).unwrap().contains("no full dataset"));
}

#[test]
fn test_new_dataset_resets_state() {
    let mut session = Session::new(PipelineConfig::default()).unwrap();
    session.load_bytes(fcs_bytes(&ramp(10), "")).unwrap();
    session.matrix_mut().set_coeff(0, 1, 0.3).unwrap();
    session
        .gates_mut()
        .add(GateRect::new(0, 1, (0.0, 1.0), (0.0, 1.0)));
    session.start_apply().unwrap();
    assert_eq!(session.wait_for_apply(WAIT).unwrap(), ApplyStatus::Done);

    let dataset = session
        .load_bytes(fcs_bytes(&ramp(5), "$SPILLOVER|2,A,B,1,0.25,0,1|"))
        .unwrap();
    assert_eq!(dataset.file.meta.n_events, 5);
    assert_eq!(session.apply_job().status, ApplyStatus::Idle);
    assert_eq!(session.full_revision(), None);
    assert!(session.gates().is_empty());
    assert!(!session.matrix().is_dirty());
    assert_eq!(session.matrix().coeff(1, 0), 0.25);
}

#[test]
fn test_failed_load_keeps_previous_dataset() {
    let mut session = Session::new(PipelineConfig::default()).unwrap();
    session.load_bytes(fcs_bytes(&ramp(3), "")).unwrap();
    assert!(session.load_bytes(b"FCS3.1 broken".to_vec()).is_err());
    assert_eq!(session.dataset().unwrap().file.meta.n_events, 3);
}

#[test]
fn test_file_backed_session_and_compensation_file() {
    let mut fcs = NamedTempFile::new().unwrap();
    fcs.write_all(&fcs_bytes(&[(100, 1000), (200, 500)], "")).unwrap();
    fcs.flush().unwrap();

    let mut session = Session::new(PipelineConfig::default()).unwrap();
    session.load_path(fcs.path()).unwrap();
    session.matrix_mut().set_coeff(0, 1, 0.1).unwrap();

    let comp = NamedTempFile::new().unwrap();
    save_compensation(comp.path(), session.matrix()).unwrap();
    session.matrix_mut().reset_all();
    assert_eq!(session.matrix().coeff(0, 1), 0.0);
    load_compensation(comp.path(), session.matrix_mut()).unwrap();
    assert_eq!(session.matrix().coeff(0, 1), 0.1);

    session.start_apply().unwrap();
    assert_eq!(session.wait_for_apply(WAIT).unwrap(), ApplyStatus::Done);
    assert!(session.is_full_up_to_date());
}
