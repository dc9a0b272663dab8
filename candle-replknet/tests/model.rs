#[cfg(feature = "mkl")]
extern crate intel_mkl_src;

#[cfg(feature = "accelerate")]
extern crate accelerate_src;

use anyhow::Result;
use candle::{DType, Device, Tensor};
use candle_nn::{ModuleT, Optimizer, SGD, VarBuilder, VarMap};
use candle_replknet::{Config, RepLKNet};

fn max_abs_diff(a: &Tensor, b: &Tensor) -> Result<f32> {
    let diff = (a - b)?.abs()?.flatten_all()?.to_vec1::<f32>()?;
    Ok(diff.into_iter().fold(0f32, f32::max))
}

/// A two-stage toy variant, small enough for CPU tests.
fn tiny_config() -> Config {
    Config {
        large_kernel_sizes: vec![7, 7],
        layers: vec![1, 1],
        channels: vec![8, 16],
        drop_path_rate: 0.1,
        small_kernel: Some(3),
        dw_ratio: 1.,
        ffn_ratio: 2.,
        in_channels: 3,
        num_classes: Some(10),
        out_indices: None,
        norm_intermediate_features: false,
    }
}

fn tiny_model(cfg: &Config) -> Result<(RepLKNet, VarMap)> {
    let varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
    let model = RepLKNet::new(cfg, vb)?;
    Ok((model, varmap))
}

#[test]
fn output_modes_are_exclusive() -> Result<()> {
    let neither = Config {
        num_classes: None,
        out_indices: None,
        ..tiny_config()
    };
    assert!(tiny_model(&neither).is_err());

    let both = Config {
        num_classes: Some(10),
        out_indices: Some(vec![0, 1]),
        ..tiny_config()
    };
    assert!(tiny_model(&both).is_err());

    let norm_but_classifying = Config {
        norm_intermediate_features: true,
        ..tiny_config()
    };
    assert!(tiny_model(&norm_but_classifying).is_err());
    Ok(())
}

#[test]
fn invalid_kernel_pair_fails_at_construction() -> Result<()> {
    let cfg = Config {
        small_kernel: Some(9),
        ..tiny_config()
    };
    assert!(tiny_model(&cfg).is_err());
    Ok(())
}

#[test]
fn out_indices_must_be_increasing_and_in_range() -> Result<()> {
    let cfg = tiny_config().with_out_indices(vec![1, 0], false);
    assert!(tiny_model(&cfg).is_err());
    let cfg = tiny_config().with_out_indices(vec![0, 2], false);
    assert!(tiny_model(&cfg).is_err());
    Ok(())
}

#[test]
fn classification_logits_shape() -> Result<()> {
    let (model, _varmap) = tiny_model(&tiny_config())?;
    let xs = Tensor::randn(0f32, 1f32, (2, 3, 32, 32), &Device::Cpu)?;
    let logits = model.forward_t(&xs, false)?;
    assert_eq!(logits.dims(), &[2, 10]);
    // The feature interface is not available in this mode.
    assert!(model.forward_features(&xs, false).is_err());
    Ok(())
}

#[test]
fn feature_maps_shapes_and_order() -> Result<()> {
    let cfg = tiny_config().with_out_indices(vec![0, 1], true);
    let (model, _varmap) = tiny_model(&cfg)?;
    // The stem divides the spatial size by 4, each transition by 2 more.
    let xs = Tensor::randn(0f32, 1f32, (1, 3, 32, 32), &Device::Cpu)?;
    let features = model.forward_features(&xs, false)?;
    assert_eq!(features.len(), 2);
    assert_eq!(features[0].dims(), &[1, 8, 8, 8]);
    assert_eq!(features[1].dims(), &[1, 16, 4, 4]);
    // The classification interface is not available in this mode.
    assert!(model.forward_t(&xs, false).is_err());
    Ok(())
}

#[test]
fn inference_is_deterministic() -> Result<()> {
    // Non-zero drop-path rate, but inference never takes random decisions.
    let (model, _varmap) = tiny_model(&tiny_config())?;
    let xs = Tensor::randn(0f32, 1f32, (1, 3, 32, 32), &Device::Cpu)?;
    let first = model.forward_t(&xs, false)?.flatten_all()?.to_vec1::<f32>()?;
    let second = model.forward_t(&xs, false)?.flatten_all()?.to_vec1::<f32>()?;
    assert_eq!(first, second);
    Ok(())
}

#[test]
fn structural_reparam_preserves_logits() -> Result<()> {
    let (mut model, _varmap) = tiny_model(&tiny_config())?;
    let xs = Tensor::randn(0f32, 1f32, (1, 3, 32, 32), &Device::Cpu)?;
    let before = model.forward_t(&xs, false)?;
    model.structural_reparam()?;
    let after = model.forward_t(&xs, false)?;
    assert!(max_abs_diff(&before, &after)? < 1e-4);
    // A second pass has nothing left to merge.
    model.structural_reparam()?;
    Ok(())
}

#[test]
fn backbone_is_trainable() -> Result<()> {
    let (model, varmap) = tiny_model(&tiny_config())?;
    let head_weight = {
        varmap
            .data()
            .lock()
            .unwrap()
            .get("head.weight")
            .unwrap()
            .clone()
    };
    let initial = head_weight.as_tensor().flatten_all()?.to_vec1::<f32>()?;

    let xs = Tensor::randn(0f32, 1f32, (2, 3, 32, 32), &Device::Cpu)?;
    let logits = model.forward_t(&xs, true)?;
    let loss = logits.sqr()?.mean_all()?;
    let mut sgd = SGD::new(varmap.all_vars(), 0.1)?;
    sgd.backward_step(&loss)?;

    let updated = head_weight.as_tensor().flatten_all()?.to_vec1::<f32>()?;
    assert_ne!(initial, updated);
    Ok(())
}
