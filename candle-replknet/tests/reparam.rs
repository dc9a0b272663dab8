#[cfg(feature = "mkl")]
extern crate intel_mkl_src;

#[cfg(feature = "accelerate")]
extern crate accelerate_src;

use anyhow::Result;
use candle::{DType, Device, Tensor};
use candle_nn::{ModuleT, VarBuilder, VarMap};
use candle_replknet::ReparamLargeKernelConv;

fn max_abs_diff(a: &Tensor, b: &Tensor) -> Result<f32> {
    let diff = (a - b)?.abs()?.flatten_all()?.to_vec1::<f32>()?;
    Ok(diff.into_iter().fold(0f32, f32::max))
}

/// Runs a few training-mode forwards so the batchnorm running statistics move
/// away from their (0, 1) initialization before the merge is exercised.
fn warm_up(conv: &ReparamLargeKernelConv, channels: usize, dev: &Device) -> Result<()> {
    for _ in 0..3 {
        let xs = Tensor::randn(0f32, 1f32, (2, channels, 16, 16), dev)?;
        conv.forward_t(&xs, true)?;
    }
    Ok(())
}

fn merge_preserves_output(large: usize, small: Option<usize>) -> Result<()> {
    let dev = &Device::Cpu;
    let varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, DType::F32, dev);
    let channels = 8;
    let mut conv =
        ReparamLargeKernelConv::new(channels, channels, large, 1, channels, small, vb)?;
    warm_up(&conv, channels, dev)?;

    let xs = Tensor::randn(0f32, 1f32, (2, channels, 16, 16), dev)?;
    let before = conv.forward_t(&xs, false)?;
    assert!(!conv.is_merged());

    conv.merge_kernel()?;
    assert!(conv.is_merged());
    let after = conv.forward_t(&xs, false)?;

    assert_eq!(before.dims(), after.dims());
    assert!(max_abs_diff(&before, &after)? < 1e-4);
    Ok(())
}

#[test]
fn merge_preserves_output_with_small_branch() -> Result<()> {
    merge_preserves_output(13, Some(5))
}

#[test]
fn merge_preserves_output_without_small_branch() -> Result<()> {
    merge_preserves_output(7, None)
}

#[test]
fn merge_preserves_output_equal_kernels() -> Result<()> {
    merge_preserves_output(5, Some(5))
}

#[test]
fn small_kernel_cannot_exceed_large() -> Result<()> {
    let dev = &Device::Cpu;
    let varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, DType::F32, dev);
    assert!(ReparamLargeKernelConv::new(4, 4, 3, 1, 4, Some(5), vb).is_err());
    Ok(())
}

#[test]
fn merge_is_terminal() -> Result<()> {
    let dev = &Device::Cpu;
    let varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, DType::F32, dev);
    let mut conv = ReparamLargeKernelConv::new(4, 4, 7, 1, 4, Some(3), vb)?;
    conv.merge_kernel()?;
    // The training-time branches are gone.
    assert!(conv.equivalent_kernel_bias().is_err());
    // Merging again is a no-op, not an error.
    conv.merge_kernel()?;
    assert!(conv.is_merged());
    Ok(())
}
