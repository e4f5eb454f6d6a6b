use scaleflip_rotation::{Rotation, RotationPlan, RotationReport};

use super::{TargetArgs, azure_gateway};

pub async fn rotate(
    target: &TargetArgs,
    scale_out_factor: Option<f64>,
    scale_in_factor: Option<f64>,
    format: &str,
) -> anyhow::Result<()> {
    let config = target.load_config(scale_out_factor, scale_in_factor)?;
    let gateway = azure_gateway(&config)?;

    let mut rotation = Rotation::new(
        gateway,
        target.scale_set(),
        RotationPlan::from(&config.rotation),
    );
    let report = rotation.run().await?;

    match format {
        "json" => {
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        _ => {
            println!("{}", format_report(&report));
        }
    }

    Ok(())
}

pub fn format_report(report: &RotationReport) -> String {
    format!(
        "✓ Rotated {}: {} → {} → {} instances\n  protected:   {}\n  unprotected: {}\n  elapsed:     {}s",
        report.scale_set,
        report.original_capacity,
        report.scaled_out_capacity,
        report.final_capacity,
        report.protected,
        report.unprotected,
        report.elapsed_secs,
    )
}
