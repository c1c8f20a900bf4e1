//! Pressure-volume recordings: cycle detection, averaging
//! and extraction of a single representative loop.
//!
//! A recording is a long trace of simultaneous pressure and volume samples
//! covering many heartbeats. [`representative_loop`] runs the whole pipeline:
//! the trace is cut into cycles at the pressure peaks, the cycles are
//! resampled to a common length and averaged, the averaged loop is cut
//! where it closes on itself and finally rotated to start at end-diastole.

use std::{io::Write, path::Path};

/// Error in reading or processing PV data.
#[derive(thiserror::Error, Debug)]
pub enum PvError {
    /// Reading or writing a file failed.
    #[error("PV file I/O failed")]
    Io(#[from] std::io::Error),
    /// A value in a data file isn't a number.
    #[error("Line {line}: {msg}")]
    Parse {
        /// One-based line number.
        line: usize,
        /// Description of the problem.
        msg: String,
    },
    /// There are too few samples for the requested operation.
    #[error("Not enough samples: need more than {needed}, got {got}")]
    TooShort {
        /// Minimum number of samples the operation needs.
        needed: usize,
        /// Number of samples given.
        got: usize,
    },
    /// Fewer than two pressure peaks, so no complete cycle.
    #[error("No complete cardiac cycle found")]
    NoCycles,
}

/// Simultaneous pressure and volume samples.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct PvData {
    /// Pressure samples.
    pub pressures: Vec<f64>,
    /// Volume samples, one per pressure sample.
    pub volumes: Vec<f64>,
}

impl PvData {
    /// Pair up pressure and volume samples.
    ///
    /// Panics if the lengths differ.
    pub fn new(pressures: Vec<f64>, volumes: Vec<f64>) -> Self {
        assert_eq!(
            pressures.len(),
            volumes.len(),
            "every pressure sample needs a volume sample"
        );
        Self { pressures, volumes }
    }

    /// Number of samples.
    #[inline]
    pub fn len(&self) -> usize {
        self.pressures.len()
    }

    /// Whether there are no samples.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.pressures.is_empty()
    }

    fn slice(&self, range: std::ops::Range<usize>) -> Self {
        Self {
            pressures: self.pressures[range.clone()].to_vec(),
            volumes: self.volumes[range].to_vec(),
        }
    }
}

/// Settings of [`representative_loop`].
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct LoopParams {
    /// Smallest number of samples between two pressure peaks.
    pub peak_distance: usize,
    /// Number of samples in the averaged cycle.
    pub samples: usize,
    /// Number of samples at the start of the averaged cycle
    /// that can't be the closing point of the loop.
    pub closing_offset: usize,
}

impl Default for LoopParams {
    fn default() -> Self {
        Self {
            peak_distance: 150,
            samples: 100,
            closing_offset: 50,
        }
    }
}

/// Read pressure and volume columns from a comma-separated file.
///
/// Columns are indexed from zero. A first line that doesn't parse
/// as numbers is taken to be a header and skipped, as are blank lines.
pub fn load_pv_csv(
    path: impl AsRef<Path>,
    p_col: usize,
    v_col: usize,
) -> Result<PvData, PvError> {
    let text = std::fs::read_to_string(path.as_ref())?;
    let mut data = PvData::default();
    for (line_idx, line) in text.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let fields: Vec<&str> = line.split(',').map(str::trim).collect();
        let field = |col: usize| -> Result<f64, PvError> {
            let raw = fields.get(col).ok_or_else(|| PvError::Parse {
                line: line_idx + 1,
                msg: format!("missing column {col}"),
            })?;
            raw.parse().map_err(|_| PvError::Parse {
                line: line_idx + 1,
                msg: format!("{raw:?} in column {col} is not a number"),
            })
        };
        match (field(p_col), field(v_col)) {
            (Ok(p), Ok(v)) => {
                data.pressures.push(p);
                data.volumes.push(v);
            }
            (Err(_), _) | (_, Err(_)) if line_idx == 0 => {
                tracing::debug!(header = line, "skipping header line");
            }
            (Err(e), _) | (_, Err(e)) => return Err(e),
        }
    }
    tracing::info!(samples = data.len(), "loaded PV recording");
    Ok(data)
}

/// Write a loop as two comma-separated rows, pressures first.
pub fn write_pv_csv(path: impl AsRef<Path>, data: &PvData) -> Result<(), PvError> {
    let file = std::fs::File::create(path.as_ref())?;
    let mut writer = std::io::BufWriter::new(file);
    for row in [&data.pressures, &data.volumes] {
        let line = row
            .iter()
            .map(|x| format!("{x:.18e}"))
            .collect::<Vec<_>>()
            .join(",");
        writeln!(writer, "{line}")?;
    }
    writer.flush()?;
    Ok(())
}

/// Indices of the peaks of a signal.
///
/// A peak is a sample larger than both of its neighbours;
/// for a flat top the middle sample (rounded down) is the peak.
/// Then, starting from the highest, every peak removes the lower peaks
/// closer to it than `distance` samples.
/// Endpoints are never peaks. The result is in ascending order.
pub fn find_peaks(signal: &[f64], distance: usize) -> Vec<usize> {
    let peaks = local_maxima(signal);
    if distance <= 1 || peaks.len() < 2 {
        return peaks;
    }

    let mut order: Vec<usize> = (0..peaks.len()).collect();
    order.sort_by(|&a, &b| signal[peaks[b]].total_cmp(&signal[peaks[a]]));

    let mut keep = vec![true; peaks.len()];
    for i in order {
        if !keep[i] {
            continue;
        }
        let mut j = i;
        while j > 0 && peaks[i] - peaks[j - 1] < distance {
            keep[j - 1] = false;
            j -= 1;
        }
        let mut j = i + 1;
        while j < peaks.len() && peaks[j] - peaks[i] < distance {
            keep[j] = false;
            j += 1;
        }
    }

    peaks
        .into_iter()
        .zip(keep)
        .filter_map(|(p, k)| k.then_some(p))
        .collect()
}

fn local_maxima(x: &[f64]) -> Vec<usize> {
    let mut peaks = Vec::new();
    if x.len() < 3 {
        return peaks;
    }
    let last = x.len() - 1;
    let mut i = 1;
    while i < last {
        if x[i - 1] < x[i] {
            let mut ahead = i + 1;
            while ahead < last && x[ahead] == x[i] {
                ahead += 1;
            }
            if x[ahead] < x[i] {
                peaks.push((i + ahead - 1) / 2);
                i = ahead;
            }
        }
        i += 1;
    }
    peaks
}

/// Cut a recording into cycles at its pressure peaks.
///
/// Each cycle runs from one peak up to (not including) the next,
/// so samples before the first and after the last peak are dropped.
pub fn divide_cycles(data: &PvData, peak_distance: usize) -> Vec<PvData> {
    let peaks = find_peaks(&data.pressures, peak_distance);
    peaks
        .windows(2)
        .map(|w| data.slice(w[0]..w[1]))
        .collect()
}

/// Resample arrays of possibly different lengths to a common length
/// and average them sample by sample.
///
/// Each array is read as a piecewise linear function of its sample index
/// and evaluated at `len` evenly spaced points from 0 to one less than
/// the longest array's length, extrapolating past the end of shorter arrays.
/// An array of a single sample is constant.
pub fn average_array<A: AsRef<[f64]>>(arrays: &[A], len: usize) -> Vec<f64> {
    let max_len = arrays.iter().map(|a| a.as_ref().len()).max().unwrap_or(0);
    if max_len == 0 || len == 0 {
        return Vec::new();
    }
    let nonempty: Vec<&[f64]> = arrays
        .iter()
        .map(AsRef::as_ref)
        .filter(|a| !a.is_empty())
        .collect();

    let end = (max_len - 1) as f64;
    (0..len)
        .map(|k| {
            let t = if len == 1 {
                0.
            } else {
                end * k as f64 / (len - 1) as f64
            };
            let sum: f64 = nonempty.iter().map(|a| interpolate(a, t)).sum();
            sum / nonempty.len() as f64
        })
        .collect()
}

fn interpolate(y: &[f64], t: f64) -> f64 {
    if y.len() == 1 {
        return y[0];
    }
    let seg = (t.floor().max(0.) as usize).min(y.len() - 2);
    let frac = t - seg as f64;
    y[seg] + frac * (y[seg + 1] - y[seg])
}

/// Cut a loop where it returns closest to its starting point.
///
/// Pressure and volume are scaled by their maxima so both count equally.
/// The first `offset` samples can't be the closing point.
/// The sample closest to the start is excluded from the result.
pub fn slice_loop(data: &PvData, offset: usize) -> Result<PvData, PvError> {
    if data.len() <= offset {
        return Err(PvError::TooShort {
            needed: offset,
            got: data.len(),
        });
    }
    let scale = |xs: &[f64]| {
        let max = xs.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        if max != 0. && max.is_finite() {
            max
        } else {
            1.
        }
    };
    let (ps, vs) = (scale(&data.pressures), scale(&data.volumes));
    let (p0, v0) = (data.pressures[0] / ps, data.volumes[0] / vs);

    let mut closest = offset;
    let mut min_dist = f64::INFINITY;
    for i in offset..data.len() {
        let dp = data.pressures[i] / ps - p0;
        let dv = data.volumes[i] / vs - v0;
        let dist = dp.hypot(dv);
        if dist < min_dist {
            min_dist = dist;
            closest = i;
        }
    }
    Ok(data.slice(0..closest))
}

/// Rotate a loop so that it starts at its largest volume (end-diastole).
pub fn rotate_to_end_diastole(data: &PvData) -> PvData {
    let Some(ed) = argmax(&data.volumes) else {
        return data.clone();
    };
    let mut rotated = data.clone();
    rotated.pressures.rotate_left(ed);
    rotated.volumes.rotate_left(ed);
    rotated
}

fn argmax(xs: &[f64]) -> Option<usize> {
    let mut best: Option<(usize, f64)> = None;
    for (i, &x) in xs.iter().enumerate() {
        if best.map_or(true, |(_, b)| x > b) {
            best = Some((i, x));
        }
    }
    best.map(|(i, _)| i)
}

/// Smooth a closed loop with a periodic Gaussian kernel
/// and resample it at `samples` evenly spaced points.
///
/// `sigma` is the kernel width measured in input samples.
pub fn smooth_periodic(data: &PvData, samples: usize, sigma: f64) -> PvData {
    let n = data.len();
    if n == 0 || samples == 0 {
        return PvData::default();
    }
    let n_f = n as f64;
    let mut out = PvData {
        pressures: Vec::with_capacity(samples),
        volumes: Vec::with_capacity(samples),
    };
    for k in 0..samples {
        let t = n_f * k as f64 / samples as f64;
        let (mut wsum, mut p, mut v) = (0., 0., 0.);
        for j in 0..n {
            let d = (t - j as f64).rem_euclid(n_f);
            let d = d.min(n_f - d);
            let w = if sigma > 0. {
                (-0.5 * (d / sigma).powi(2)).exp()
            } else if d < 0.5 {
                1.
            } else {
                0.
            };
            wsum += w;
            p += w * data.pressures[j];
            v += w * data.volumes[j];
        }
        if wsum > 0. {
            out.pressures.push(p / wsum);
            out.volumes.push(v / wsum);
        } else {
            let nearest = (t.round() as usize) % n;
            out.pressures.push(data.pressures[nearest]);
            out.volumes.push(data.volumes[nearest]);
        }
    }
    out
}

/// Extract one representative loop from a multi-beat recording,
/// starting at end-diastole.
pub fn representative_loop(data: &PvData, params: &LoopParams) -> Result<PvData, PvError> {
    let cycles = divide_cycles(data, params.peak_distance);
    if cycles.is_empty() {
        return Err(PvError::NoCycles);
    }
    tracing::info!(cycles = cycles.len(), "divided recording into cycles");

    let pressures: Vec<&[f64]> = cycles.iter().map(|c| c.pressures.as_slice()).collect();
    let volumes: Vec<&[f64]> = cycles.iter().map(|c| c.volumes.as_slice()).collect();
    let average = PvData::new(
        average_array(&pressures, params.samples),
        average_array(&volumes, params.samples),
    );

    let sliced = slice_loop(&average, params.closing_offset)?;
    Ok(rotate_to_end_diastole(&sliced))
}
