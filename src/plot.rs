//! Sweep plots
//!
//! Draws the mean log-probability change of both candidate tokens against
//! the number of neurons steered, with every point labelled by its value.

use std::path::Path;

use anyhow::{ensure, Result};
use plotters::prelude::*;
use tracing::info;

use crate::steering::SweepResult;

pub const SWEEP_TITLE: &str = "Log Probability Changes Across Neuron Steer";

/// Vertical axis range covering both series plus a margin for the labels
fn y_range(a: &[f32], b: &[f32]) -> (f32, f32) {
    let (lo, hi) = a
        .iter()
        .chain(b)
        .filter(|v| v.is_finite())
        .fold((0.0f32, 0.0f32), |(lo, hi), &v| (lo.min(v), hi.max(v)));
    let pad = ((hi - lo) * 0.15).max(0.1);
    (lo - pad, hi + pad)
}

/// Legend text for a series, e.g. `"Token A (lebron)"`
fn series_label(slot: char, word: &str) -> String {
    format!("Token {slot} ({word})")
}

/// Render the sweep curves of `result` to a PNG at `path`.
pub fn plot_sweep(result: &SweepResult, label_a: &str, label_b: &str, path: &Path) -> Result<()> {
    let a = result.mean_deltas_a();
    let b = result.mean_deltas_b();
    ensure!(!a.is_empty(), "Sweep has no steps to plot");

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let n = a.len();
    let (y_lo, y_hi) = y_range(&a, &b);

    let root = BitMapBackend::new(path, (1200, 800)).into_drawing_area();
    root.fill(&WHITE)
        .map_err(|e| anyhow::anyhow!("backend error: {e}"))?;

    {
        let mut chart = ChartBuilder::on(&root)
            .margin(20)
            .caption(SWEEP_TITLE, ("sans-serif", 28.0))
            .set_label_area_size(LabelAreaPosition::Left, 70)
            .set_label_area_size(LabelAreaPosition::Bottom, 60)
            .build_cartesian_2d(-0.5f32..(n as f32 - 0.5), y_lo..y_hi)
            .map_err(|e| anyhow::anyhow!("chart build error: {e}"))?;

        chart
            .configure_mesh()
            .x_desc("Neurons Steered")
            .y_desc("Log Probability")
            .x_labels(n.min(40))
            .x_label_formatter(&|x| format!("{:.0}", x))
            .draw()
            .map_err(|e| anyhow::anyhow!("mesh error: {e}"))?;

        let points_a: Vec<(f32, f32)> = a.iter().enumerate().map(|(i, &v)| (i as f32, v)).collect();
        let points_b: Vec<(f32, f32)> = b.iter().enumerate().map(|(i, &v)| (i as f32, v)).collect();

        chart
            .draw_series(LineSeries::new(points_a.clone(), &RED))
            .map_err(|e| anyhow::anyhow!("draw error: {e}"))?
            .label(series_label('A', label_a))
            .legend(|(x, y)| PathElement::new(vec![(x, y), (x + 20, y)], RED));
        chart
            .draw_series(points_a.iter().map(|&p| Circle::new(p, 4, RED.filled())))
            .map_err(|e| anyhow::anyhow!("draw error: {e}"))?;

        chart
            .draw_series(LineSeries::new(points_b.clone(), &BLUE))
            .map_err(|e| anyhow::anyhow!("draw error: {e}"))?
            .label(series_label('B', label_b))
            .legend(|(x, y)| PathElement::new(vec![(x, y), (x + 20, y)], BLUE));
        chart
            .draw_series(points_b.iter().map(|&p| Cross::new(p, 5, BLUE)))
            .map_err(|e| anyhow::anyhow!("draw error: {e}"))?;

        // Value labels above each point
        let label_style = ("sans-serif", 12.0).into_font().color(&BLACK);
        chart
            .draw_series(
                points_a
                    .iter()
                    .chain(points_b.iter())
                    .map(|&(x, y)| Text::new(format!("{y:.2}"), (x, y), label_style.clone())),
            )
            .map_err(|e| anyhow::anyhow!("draw error: {e}"))?;

        chart
            .configure_series_labels()
            .background_style(WHITE.mix(0.8))
            .border_style(BLACK)
            .draw()
            .map_err(|e| anyhow::anyhow!("legend error: {e}"))?;
    }

    root.present()
        .map_err(|e| anyhow::anyhow!("render error: {e}"))?;
    info!("Saved sweep plot to {}", path.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hooks::HookSite;
    use crate::intervention::EditKind;
    use crate::neuron::NeuronTarget;
    use crate::steering::SweepStep;

    #[test]
    fn test_y_range_includes_zero_and_pads() {
        let (lo, hi) = y_range(&[-1.0, -2.0], &[0.5, 0.25]);
        assert!(lo < -2.0);
        assert!(hi > 0.5);

        let (lo, hi) = y_range(&[0.0], &[0.0]);
        assert!((lo + 0.1).abs() < 1e-6);
        assert!((hi - 0.1).abs() < 1e-6);

        let (lo, hi) = y_range(&[f32::NAN, 1.0], &[]);
        assert!(lo < 0.0 && hi > 1.0);
    }

    #[test]
    fn test_series_label() {
        assert_eq!(series_label('A', "lebron"), "Token A (lebron)");
    }

    #[test]
    #[ignore = "needs system fonts for text rendering"]
    fn test_plot_sweep_writes_png() {
        let step = |n, a: f32, b: f32| SweepStep {
            n_steered: n,
            added: None,
            delta_a: vec![a],
            delta_b: vec![b],
            mean_delta_a: a,
            mean_delta_b: b,
        };
        let result = SweepResult {
            neurons: vec![NeuronTarget::new(2, 10263)],
            site: HookSite::MlpOut,
            kind: EditKind::Zero,
            token_a: 1,
            token_b: 2,
            baseline_a: vec![-1.0],
            baseline_b: vec![-2.0],
            steps: vec![step(0, 0.0, 0.0), step(1, -0.8, 0.3)],
        };

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("figures").join("sweep.png");
        plot_sweep(&result, "lebron", "jordan", &path).unwrap();
        let png = std::fs::read(&path).unwrap();
        assert_eq!(&png[..4], b"\x89PNG");
    }
}
