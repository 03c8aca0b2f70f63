//! Orient a grid of local affine frames on an image.
//!
//! cargo run --example orient_patches -- [image.png] [config.json]

use candle_core::{DType, Device, Module, Tensor};
use candle_imgproc::{color_rgb, io, laf, normalize, orientation};
use tracing_subscriber::{filter::LevelFilter, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Concentric rings, so every frame sees a different dominant gradient.
fn rings(h: usize, w: usize) -> anyhow::Result<Tensor> {
    let (cx, cy) = (w as f32 * 0.5, h as f32 * 0.5);
    let mut data = vec![0f32; 3 * h * w];
    for i_h in 0..h {
        for i_w in 0..w {
            let r = ((i_w as f32 - cx).powi(2) + (i_h as f32 - cy).powi(2)).sqrt();
            let v = 0.5 + 0.5 * (r * 0.15).sin();
            for i_ch in 0..3 {
                data[(i_ch * h + i_h) * w + i_w] = v * (1.0 - 0.2 * i_ch as f32);
            }
        }
    }
    Ok(Tensor::from_vec(data, (3, h, w), &Device::Cpu)?)
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            EnvFilter::builder()
                .with_default_directive(LevelFilter::INFO.into())
                .from_env_lossy(),
        )
        .init();
    let args: Vec<String> = std::env::args().collect();
    let device = Device::Cpu;
    let img = match args.get(1) {
        Some(path) => io::load_image(path, &device)?,
        None => rings(128, 160)?,
    };
    let config: orientation::OrientationConfig = match args.get(2) {
        Some(path) => io::load_config(path)?,
        None => Default::default(),
    };
    let (_, h, w) = img.dims3()?;
    tracing::info!(h, w, ?config, "input");

    let img = img.unsqueeze(0)?;
    let linear = color_rgb::rgb_to_linear_rgb(&img)?;
    let gray = linear.mean_keepdim(1)?;
    let gray = normalize::normalize_min_max(&gray, 0., 1., normalize::MIN_MAX_EPS)?;
    let standardized = normalize::Normalize::new(0.5, 0.25).forward(&gray)?;
    tracing::info!("{}", normalize::Normalize::new(0.5, 0.25));

    // frames on a regular grid, all pointing right
    let step = config.patch_size.max(8);
    let mut xy = vec![];
    for y in (step / 2..h.saturating_sub(step / 2)).step_by(step) {
        for x in (step / 2..w.saturating_sub(step / 2)).step_by(step) {
            xy.extend([x as f32, y as f32]);
        }
    }
    let n = xy.len() / 2;
    let xy = Tensor::from_vec(xy, (1, n, 2), &device)?;
    let scale = Tensor::full(step as f32 * 0.5, (1, n), &device)?;
    let ori = Tensor::zeros((1, n), DType::F32, &device)?;
    let lafs = laf::laf_from_center_scale_ori(&xy, &scale, &ori)?;

    let orienter = orientation::LafOrienter::from_config(&config)?;
    let oriented = orienter.forward(&lafs, &standardized)?;
    let angles = laf::get_laf_orientation(&oriented)?.flatten_all()?.to_vec1::<f32>()?;
    let centers = xy.flatten_all()?.to_vec1::<f32>()?;
    for (i_laf, angle) in angles.iter().enumerate() {
        tracing::info!(
            x = centers[i_laf * 2],
            y = centers[i_laf * 2 + 1],
            "orientation {angle:.1} deg"
        );
    }

    std::fs::create_dir_all("target")?;
    let bgr = color_rgb::rgb_to_bgr(&img)?.squeeze(0)?;
    io::save_image("target/orient_patches_bgr.png", &bgr)?;
    tracing::info!("wrote target/orient_patches_bgr.png");
    Ok(())
}
