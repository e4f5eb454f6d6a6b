use scaleflip_rotation::{Rotation, RotationPlan};
use tracing::info;

use super::{TargetArgs, azure_gateway};

pub async fn unprotect(target: &TargetArgs, format: &str) -> anyhow::Result<()> {
    let config = target.load_config(None, None)?;
    let gateway = azure_gateway(&config)?;
    let scale_set = target.scale_set();
    info!(scale_set = %scale_set, filter = %config.rotation.unprotect_filter, "manual unprotect requested");

    let mut rotation = Rotation::new(
        gateway,
        scale_set.clone(),
        RotationPlan::from(&config.rotation),
    );
    let cleared = rotation.unprotect().await?;

    match format {
        "json" => {
            let out = serde_json::json!({
                "scale_set": scale_set.name,
                "unprotected": cleared,
            });
            println!("{}", serde_json::to_string_pretty(&out)?);
        }
        _ => {
            println!("✓ Cleared protection on {cleared} instance(s) of {}", scale_set.name);
        }
    }

    Ok(())
}
