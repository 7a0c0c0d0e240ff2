use crate::event::{ChartKind, ChartSpec, Series};

/// Logical drawing area charts are projected into. Renderers scale
/// these coordinates to whatever space they actually have.
pub const CHART_WIDTH: f64 = 100.0;
pub const CHART_HEIGHT: f64 = 30.0;

const MAX_STRIDED_TICKS: usize = 4;

/// One labelled point on the value axis.
#[derive(Debug, Clone, PartialEq)]
pub struct Tick {
    pub index: usize,
    pub value: f64,
    pub label: String,
}

/// Drawable output of the projector: everything a renderer needs, with
/// no rendering-technology assumptions baked in.
#[derive(Debug, Clone, PartialEq)]
pub struct ChartGeometry {
    pub kind: ChartKind,
    pub title: Option<String>,
    /// `(x, y)` per finite value, inside `CHART_WIDTH` x `CHART_HEIGHT`,
    /// y growing upward from the baseline.
    pub points: Vec<(f64, f64)>,
    pub min: f64,
    pub max: f64,
    /// `max - min`, floored to 1 when the series is flat.
    pub span: f64,
    pub ticks: Vec<Tick>,
    pub labels: Vec<String>,
    /// Series beyond the first are accepted but not rendered.
    pub extra_series: usize,
}

/// Projects a chart spec into drawable geometry. Only the first series
/// is considered; a series with no finite values yields `None`, which
/// renderers treat as "draw no chart", not as an error.
pub fn project_chart(spec: &ChartSpec) -> Option<ChartGeometry> {
    let first: &Series = spec.series.first()?;
    let values: Vec<f64> = first.values.iter().copied().filter(|v| v.is_finite()).collect();
    if values.is_empty() {
        return None;
    }

    let min = values.iter().copied().fold(f64::INFINITY, f64::min);
    let max = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    let span = if max > min { max - min } else { 1.0 };

    let n = values.len();
    let x_step = if n > 1 { CHART_WIDTH / (n - 1) as f64 } else { 0.0 };
    let points: Vec<(f64, f64)> = values
        .iter()
        .enumerate()
        .map(|(i, v)| (i as f64 * x_step, (v - min) / span * CHART_HEIGHT))
        .collect();

    Some(ChartGeometry {
        kind: spec.kind,
        title: spec.title.clone(),
        points,
        min,
        max,
        span,
        ticks: value_ticks(&values),
        labels: category_labels(spec, n),
        extra_series: spec.series.len().saturating_sub(1),
    })
}

/// Up to four evenly-strided ticks, plus the final value always.
fn value_ticks(values: &[f64]) -> Vec<Tick> {
    let n = values.len();
    let stride = (n.max(1) + MAX_STRIDED_TICKS - 1) / MAX_STRIDED_TICKS;
    let mut ticks: Vec<Tick> = (0..n)
        .step_by(stride.max(1))
        .take(MAX_STRIDED_TICKS)
        .map(|index| Tick {
            index,
            value: values[index],
            label: format_value(values[index]),
        })
        .collect();
    let last = n - 1;
    if ticks.last().map(|t| t.index) != Some(last) {
        ticks.push(Tick {
            index: last,
            value: values[last],
            label: format_value(values[last]),
        });
    }
    ticks
}

/// Labels come from the spec only when they line up one-to-one with the
/// series; anything else falls back to 1-based ordinals.
fn category_labels(spec: &ChartSpec, n: usize) -> Vec<String> {
    if spec.labels.len() == n {
        spec.labels.clone()
    } else {
        (1..=n).map(|i| i.to_string()).collect()
    }
}

/// SI-style axis formatting: `B`/`M`/`k` scaling with one decimal,
/// integers from 100 up, two decimals from 1 up, two significant
/// digits below that.
pub fn format_value(value: f64) -> String {
    let magnitude = value.abs();
    if magnitude >= 1e9 {
        format!("{:.1}B", value / 1e9)
    } else if magnitude >= 1e6 {
        format!("{:.1}M", value / 1e6)
    } else if magnitude >= 1e3 {
        format!("{:.1}k", value / 1e3)
    } else if magnitude >= 100.0 {
        format!("{value:.0}")
    } else if magnitude >= 1.0 {
        format!("{value:.2}")
    } else if magnitude == 0.0 {
        "0".to_string()
    } else {
        let decimals = (1 - magnitude.log10().floor() as i32).max(0) as usize;
        format!("{value:.decimals$}")
    }
}
