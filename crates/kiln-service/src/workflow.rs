use kiln_core::orchestrator::JobParams;
use kiln_core::ServiceConfig;
use serde_json::{json, Value};

const NEGATIVE_DEFAULT: &str = "blurry, low quality, watermark, text";

/// Declarative node graph for one text-to-image run.
///
/// checkpoint loader → positive/negative text encoders → empty latent sized
/// from `params.size` → sampler → VAE decode → save.
pub fn build_workflow(params: &JobParams, quality: &ServiceConfig) -> Value {
    let (width, height) = params.size.dimensions();
    let seed = params
        .seed
        .unwrap_or_else(|| (uuid::Uuid::new_v4().as_u128() as u64) >> 1);
    let negative = params
        .negative_prompt
        .as_deref()
        .unwrap_or(NEGATIVE_DEFAULT);
    json!({
        "4": {
            "class_type": "CheckpointLoaderSimple",
            "inputs": { "ckpt_name": quality.checkpoint }
        },
        "6": {
            "class_type": "CLIPTextEncode",
            "inputs": { "text": params.prompt, "clip": ["4", 1] }
        },
        "7": {
            "class_type": "CLIPTextEncode",
            "inputs": { "text": negative, "clip": ["4", 1] }
        },
        "5": {
            "class_type": "EmptyLatentImage",
            "inputs": { "width": width, "height": height, "batch_size": 1 }
        },
        "3": {
            "class_type": "KSampler",
            "inputs": {
                "seed": seed,
                "steps": params.steps,
                "cfg": quality.cfg_scale,
                "sampler_name": quality.sampler,
                "scheduler": quality.scheduler,
                "denoise": 1.0,
                "model": ["4", 0],
                "positive": ["6", 0],
                "negative": ["7", 0],
                "latent_image": ["5", 0]
            }
        },
        "8": {
            "class_type": "VAEDecode",
            "inputs": { "samples": ["3", 0], "vae": ["4", 2] }
        },
        "9": {
            "class_type": "SaveImage",
            "inputs": { "filename_prefix": "kiln", "images": ["8", 0] }
        }
    })
}

/// Body for `POST /prompt`, tagged with the push-channel client id.
pub fn prompt_request(workflow: Value, client_id: &str) -> Value {
    json!({
        "prompt": workflow,
        "client_id": client_id,
        "extra_data": { "kiln_client": client_id },
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use kiln_core::orchestrator::JobSpec;

    fn params(spec: Value) -> JobParams {
        JobSpec::from_value(spec).unwrap().validate(20).unwrap()
    }

    #[test]
    fn latent_follows_size() {
        let cfg = ServiceConfig::default();
        let wf = build_workflow(&params(json!({"prompt": "p", "size": "large"})), &cfg);
        assert_eq!(wf["5"]["inputs"]["width"], 1024);
        let wf = build_workflow(&params(json!({"prompt": "p"})), &cfg);
        assert_eq!(wf["5"]["inputs"]["height"], 768);
    }

    #[test]
    fn sampler_uses_params_and_quality() {
        let cfg = ServiceConfig {
            sampler: "dpmpp_2m".into(),
            ..ServiceConfig::default()
        };
        let wf = build_workflow(
            &params(json!({"prompt": "harbor district", "steps": 30, "seed": 7})),
            &cfg,
        );
        let sampler = &wf["3"]["inputs"];
        assert_eq!(sampler["steps"], 30);
        assert_eq!(sampler["seed"], 7);
        assert_eq!(sampler["sampler_name"], "dpmpp_2m");
        assert_eq!(wf["6"]["inputs"]["text"], "harbor district");
        assert_eq!(wf["7"]["inputs"]["text"], NEGATIVE_DEFAULT);
    }

    #[test]
    fn request_carries_client_id() {
        let body = prompt_request(json!({}), "c-1");
        assert_eq!(body["client_id"], "c-1");
        assert!(body["prompt"].is_object());
    }
}
