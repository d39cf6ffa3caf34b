use burn::tensor::Tensor;
use burn_ndarray::NdArray;
use log::{error, info};

use tabpfn_transformer::{
    settings, ForwardOptions, ModelConfig, PerFeatureTransformer, TransformerOptions,
};

type Backend = NdArray<f32>;

fn run() -> tabpfn_transformer::Result<()> {
    let settings = settings();
    info!("inference settings: {:?}", settings.inference);

    let config = ModelConfig {
        emsize: 32,
        nhead: 4,
        nlayers: 2,
        ..ModelConfig::default()
    };
    let options = TransformerOptions {
        n_out: 2,
        ..TransformerOptions::from_settings(settings)
    };
    let device = Default::default();
    let mut model = PerFeatureTransformer::<Backend>::new(&config, &options, &device)?;

    let (seq_len, train_rows, features) = (8, 6, 5);
    let x_values: Vec<f32> = (0..seq_len * features).map(|i| (i as f32 * 0.3).sin()).collect();
    let x = Tensor::<Backend, 1>::from_floats(x_values.as_slice(), &device).reshape([seq_len, 1, features]);
    let y_values: Vec<f32> = (0..train_rows).map(|i| (i % 2) as f32).collect();
    let y = Tensor::<Backend, 1>::from_floats(y_values.as_slice(), &device);

    let out = model
        .forward_xy(x, Some(y.into()), ForwardOptions::default().with_single_eval_pos(train_rows))?
        .standard()
        .ok_or_else(|| tabpfn_transformer::TransformerError::usage("no standard output"))?;
    info!("output shape: {:?}", out.dims());
    println!("{:?}", out.into_data());
    Ok(())
}

fn main() {
    env_logger::init();
    if let Err(e) = run() {
        error!("{e}");
        std::process::exit(1);
    }
}
