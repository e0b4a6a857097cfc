use mimalloc::MiMalloc;

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

use ptq_calib::quantization::observers::utils::extrema;
use ptq_calib::quantization::AnyObserver;
use ptq_calib::{
    ChannelPermutation, ObserverKind, QDescriptor, QuantizationConfig, Quantizer, Tensor,
    UniformQuantizer,
};
use tracing_subscriber::EnvFilter;

fn mse(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(x, y)| (x - y) * (x - y)).sum::<f32>() / a.len() as f32
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("debug"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    println!("Post-training calibration of a conv layer\n");

    // Activations: post-ReLU feature maps [N, C, H, W], calibrated per tensor with ACIQ
    let act_config = QuantizationConfig::default().with_observer("aciq").with_bit(4);
    let mut act_q = UniformQuantizer::from_config(&act_config)?;
    for _ in 0..8 {
        let x = Tensor::randn(&[4, 16, 8, 8]);
        let relu: Vec<f32> = x.data().iter().map(|v| v.max(0.0)).collect();
        act_q.observe(&Tensor::new(relu, &[4, 16, 8, 8]))?;
    }
    let qparams = act_q.calibrate()?.clone();
    println!(
        "activations: scale {:.5}, zero point {}",
        qparams.scale[0], qparams.zero_point[0]
    );
    if let AnyObserver::Aciq(obs) = act_q.observer() {
        println!("  hypothesis: {:?}", obs.selection());
    }

    // Weights [out, in, kh, kw] with two magnitude families, grouped per channel
    let out_channels = 8;
    let w = Tensor::randn(&[out_channels, 16, 3, 3]);
    let scaled: Vec<f32> = w
        .data()
        .chunks(16 * 9)
        .enumerate()
        .flat_map(|(c, row)| {
            let gain = if c % 2 == 0 { 0.05 } else { 1.0 };
            row.iter().map(move |v| v * gain).collect::<Vec<_>>()
        })
        .collect();
    let w = Tensor::new(scaled, &[out_channels, 16, 3, 3]);

    let peaks: Vec<f32> = w
        .data()
        .chunks(16 * 9)
        .map(|row| {
            let (lo, hi) = extrema(row);
            lo.abs().max(hi.abs())
        })
        .collect();

    for (label, perm) in [
        ("natural order", ChannelPermutation::identity(out_channels)),
        ("sorted by peak", ChannelPermutation::sorted_by(&peaks)),
    ] {
        let qdesc = QDescriptor::channelwise(4, 0).with_groups(2).with_signed(true);
        let mut w_q = UniformQuantizer::new(ObserverKind::MinMax.build(qdesc)?);
        w_q.set_permutation(perm)?;
        w_q.observe(&w)?;
        w_q.calibrate()?;

        let w_fq = w_q.forward(&w)?;
        println!(
            "weights ({label}): reconstruction mse {:.6}",
            mse(&w.data(), &w_fq.data())
        );
    }

    Ok(())
}
