use compinj::{
    metrics::{Evaluation, Metrics},
    snr::{windowed_snr, SnrReport, SnrWindow},
    sweep::{Sweep, TrialRecord},
    CompressorKind, ErrorBound, Evaluator, Harness, InjectionSite, Shape, Tensor,
};
use numpy::{
    ndarray::{ArrayD, IxDyn},
    IntoPyArray, PyArrayDyn, PyReadonlyArrayDyn,
};
use pyo3::{
    exceptions::PyValueError,
    prelude::*,
    types::{PyBytes, PyDict},
};

fn value_error(e: impl std::fmt::Display) -> PyErr {
    PyValueError::new_err(e.to_string())
}

/// numpy arrays are C ordered (last axis fastest); shapes here list the fastest axis first.
fn shape_of(array: &PyReadonlyArrayDyn<'_, f32>) -> PyResult<Shape> {
    let dims: Vec<usize> = array.shape().iter().rev().copied().collect();
    Shape::new(&dims).map_err(value_error)
}

fn tensor_from(array: &PyReadonlyArrayDyn<'_, f32>) -> PyResult<Tensor> {
    let shape = shape_of(array)?;
    let data = array
        .as_slice()
        .map_err(|_| PyValueError::new_err("array is not contiguous C order"))?
        .to_vec();
    Tensor::new(data, shape).map_err(value_error)
}

fn metrics_dict<'py>(py: Python<'py>, m: &Metrics) -> PyResult<&'py PyDict> {
    let dict = PyDict::new(py);
    dict.set_item("violations", m.violation_count())?;
    dict.set_item("max_abs_diff", m.max_abs_diff)?;
    dict.set_item("rmse", m.rmse)?;
    dict.set_item("psnr", m.psnr)?;
    Ok(dict)
}

fn evaluation_dict<'py>(py: Python<'py>, evaluation: &Evaluation) -> PyResult<&'py PyDict> {
    match evaluation {
        Evaluation::Complete(m) => metrics_dict(py, m),
        Evaluation::FirstViolation(v) => {
            let dict = PyDict::new(py);
            dict.set_item("index", v.index)?;
            dict.set_item("original", v.original)?;
            dict.set_item("reconstructed", v.reconstructed)?;
            dict.set_item("diff", v.diff)?;
            dict.set_item("bound", v.bound)?;
            Ok(dict)
        }
    }
}

fn snr_dict<'py>(py: Python<'py>, r: &SnrReport) -> PyResult<&'py PyDict> {
    let dict = PyDict::new(py);
    dict.set_item("x", (r.x.start, r.x.end))?;
    dict.set_item("y", (r.y.start, r.y.end))?;
    dict.set_item("z", (r.z.start, r.z.end))?;
    dict.set_item("count", r.count)?;
    dict.set_item("mean_raw", r.mean_raw)?;
    dict.set_item("mean_reconstructed", r.mean_reconstructed)?;
    dict.set_item("mean_error", r.mean_error)?;
    dict.set_item("stdev_raw", r.stdev_raw)?;
    dict.set_item("stdev_reconstructed", r.stdev_reconstructed)?;
    dict.set_item("stdev_error", r.stdev_error)?;
    dict.set_item("snr_db", r.snr_db)?;
    Ok(dict)
}

fn record_dict<'py>(py: Python<'py>, r: &TrialRecord) -> PyResult<&'py PyDict> {
    let dict = PyDict::new(py);
    dict.set_item("data_size", r.data_size)?;
    dict.set_item("compression_ratio", r.compression_ratio)?;
    dict.set_item("error_info", &r.error_info)?;
    dict.set_item("byte", r.byte_location)?;
    dict.set_item("bit", r.flip_location)?;
    dict.set_item("decompression_time", r.decompression_time)?;
    dict.set_item("incorrect", r.incorrect)?;
    dict.set_item("max_difference", r.max_difference)?;
    dict.set_item("rmse", r.rmse)?;
    dict.set_item("psnr", r.psnr)?;
    dict.set_item("status", format!("{:?}", r.status))?;
    dict.set_item("detail", &r.detail)?;
    Ok(dict)
}

fn configure(compressor: &str, mode: &str, bound: f64) -> PyResult<Harness> {
    let kind = CompressorKind::parse(compressor).map_err(value_error)?;
    let bound = ErrorBound::parse(mode, bound).map_err(value_error)?;
    Harness::new(kind, bound).map_err(value_error)
}

/// Returns a copy of `buffer` with bit `bit` of byte `byte` flipped.
#[pyfunction]
fn flip_bit<'py>(py: Python<'py>, buffer: &[u8], byte: usize, bit: u32) -> PyResult<&'py PyBytes> {
    let site = InjectionSite::new(byte, bit, true).map_err(value_error)?;
    if byte >= buffer.len() {
        return Err(PyValueError::new_err(format!(
            "byte {byte} outside buffer of {} bytes",
            buffer.len()
        )));
    }
    let mut corrupted = buffer.to_vec();
    compinj::inject(&mut corrupted, &site);
    Ok(PyBytes::new(py, &corrupted))
}

/// Accuracy metrics of `reconstructed` against `original` under an error-bounding mode.
#[pyfunction]
#[pyo3(signature = (original, reconstructed, mode, bound, reference_bound=None, stop_at_first=false))]
fn evaluate<'py>(
    py: Python<'py>,
    original: PyReadonlyArrayDyn<'py, f32>,
    reconstructed: PyReadonlyArrayDyn<'py, f32>,
    mode: &str,
    bound: f64,
    reference_bound: Option<f64>,
    stop_at_first: bool,
) -> PyResult<&'py PyDict> {
    let bound = ErrorBound::parse(mode, bound).map_err(value_error)?;
    let (Ok(original), Ok(reconstructed)) = (original.as_slice(), reconstructed.as_slice()) else {
        return Err(PyValueError::new_err("arrays must be contiguous C order"));
    };
    let evaluation = Evaluator::new(bound)
        .with_reference_bound(reference_bound)
        .stop_at_first_violation(stop_at_first)
        .evaluate(original, reconstructed)
        .map_err(value_error)?;
    evaluation_dict(py, &evaluation)
}

/// SNR over `window` = [xStart, xEnd, yStart, yEnd, zStart, zEnd], x being the last numpy axis.
#[pyfunction]
#[pyo3(signature = (original, reconstructed, window=None))]
fn snr<'py>(
    py: Python<'py>,
    original: PyReadonlyArrayDyn<'py, f32>,
    reconstructed: PyReadonlyArrayDyn<'py, f32>,
    window: Option<Vec<usize>>,
) -> PyResult<&'py PyDict> {
    let shape = shape_of(&original)?;
    let window = match window {
        Some(bounds) => SnrWindow::from_bounds(&bounds).map_err(value_error)?,
        None => SnrWindow::full(),
    };
    let (Ok(a), Ok(b)) = (original.as_slice(), reconstructed.as_slice()) else {
        return Err(PyValueError::new_err("arrays must be contiguous C order"));
    };
    let report = windowed_snr(a, b, &shape, &window).map_err(value_error)?;
    snr_dict(py, &report)
}

/// Compresses `data`, optionally flips one bit, decompresses and evaluates.
///
/// Returns `(reconstructed, report)`.
#[pyfunction]
#[pyo3(signature = (data, compressor, mode, bound, byte=None, bit=0, reference_bound=None))]
#[allow(clippy::too_many_arguments)]
fn run_experiment<'py>(
    py: Python<'py>,
    data: PyReadonlyArrayDyn<'py, f32>,
    compressor: &str,
    mode: &str,
    bound: f64,
    byte: Option<usize>,
    bit: u32,
    reference_bound: Option<f64>,
) -> PyResult<(&'py PyArrayDyn<f32>, &'py PyDict)> {
    let original = tensor_from(&data)?;
    let mut harness = configure(compressor, mode, bound)?;
    let site = match byte {
        Some(byte) => InjectionSite::new(byte, bit, true),
        None => InjectionSite::new(0, bit, false),
    }
    .map_err(value_error)?;

    let outcome = py
        .allow_threads(|| harness.run(&original, &site))
        .map_err(value_error)?;
    let evaluation = Evaluator::new(harness.bound())
        .with_reference_bound(reference_bound)
        .evaluate(original.data(), outcome.reconstructed.data())
        .map_err(value_error)?;

    let report = evaluation_dict(py, &evaluation)?;
    report.set_item("compressed_size", outcome.stats.compressed_size)?;
    report.set_item("compression_ratio", outcome.stats.compression_ratio)?;
    report.set_item("compress_time", outcome.stats.compress_time.as_secs_f64())?;
    report.set_item("decompress_time", outcome.stats.decompress_time.as_secs_f64())?;

    let reconstructed = ArrayD::from_shape_vec(IxDyn(data.shape()), outcome.reconstructed.into_data())
        .map_err(value_error)?;
    Ok((reconstructed.into_pyarray(py), report))
}

/// Flips every bit of compressed bytes `start..end` in turn, one record per trial.
#[pyfunction]
#[pyo3(signature = (data, compressor, mode, bound, start=0, end=None, reference_bound=None))]
#[allow(clippy::too_many_arguments)]
fn sweep<'py>(
    py: Python<'py>,
    data: PyReadonlyArrayDyn<'py, f32>,
    compressor: &str,
    mode: &str,
    bound: f64,
    start: usize,
    end: Option<usize>,
    reference_bound: Option<f64>,
) -> PyResult<Vec<&'py PyDict>> {
    let original = tensor_from(&data)?;
    let harness = configure(compressor, mode, bound)?;
    let evaluator = Evaluator::new(harness.bound()).with_reference_bound(reference_bound);
    let mut sweep = Sweep::new(harness, evaluator);

    let end = end.unwrap_or(usize::MAX);
    let records = py
        .allow_threads(|| sweep.run(&original, start..end))
        .map_err(value_error)?;
    records.iter().map(|r| record_dict(py, r)).collect()
}

/// Fault injection for lossy float compressors.
#[pymodule]
fn pycompinj(_py: Python, m: &PyModule) -> PyResult<()> {
    m.add_function(wrap_pyfunction!(flip_bit, m)?)?;
    m.add_function(wrap_pyfunction!(evaluate, m)?)?;
    m.add_function(wrap_pyfunction!(snr, m)?)?;
    m.add_function(wrap_pyfunction!(run_experiment, m)?)?;
    m.add_function(wrap_pyfunction!(sweep, m)?)?;
    Ok(())
}
