use std::process::ExitCode;

use itertools::Itertools;

use sluice::{ContextBuilder, Runner};

fn main() -> ExitCode {
    pretty_env_logger::init();

    let Some(path) = std::env::args().nth(1) else {
        eprintln!("usage: sluice <script.json>");
        return ExitCode::FAILURE;
    };

    match futures::executor::block_on(execute(&path)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("error: {err}");
            ExitCode::FAILURE
        }
    }
}

async fn execute(path: &str) -> Result<(), Box<dyn std::error::Error>> {
    let context = ContextBuilder::new().build().await?;

    let start = instant::Instant::now();
    let mut runner = Runner::load_file(context, path)?;
    runner.run()?;
    log::info!("script complete in {:?}", start.elapsed());

    // final contents of every declared buffer, previewed as f32 lanes
    for name in runner.registry().buffer_names() {
        let bytes = runner.registry().read_back(name)?;
        let lanes: Vec<f32> = bytemuck::pod_collect_to_vec(&bytes);
        let preview = lanes.iter().take(16).format(", ");
        println!("{name} ({} bytes): [{preview}{}]", bytes.len(), if lanes.len() > 16 { ", .." } else { "" });
    }
    Ok(())
}
