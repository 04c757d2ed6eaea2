//! Compilation of a [`PipelineSpec`] into a ComfyUI node graph.
//!
//! Nodes are numbered in insertion order and links are `[node_id, slot]`
//! pairs, matching the API-format workflow accepted by `POST /prompt`.
//! Images stream back over the socket from a `SaveImageWebsocket` node.

use imagegen_core::hashing::json_fingerprint;
use serde::Serialize;
use serde_json::{json, Map, Value};

use crate::builder::{Attachment, PipelineSpec};

// ---------------------------------------------------------------------------
// Node class types
// ---------------------------------------------------------------------------

const CHECKPOINT_LOADER: &str = "CheckpointLoaderSimple";
const CLIP_TEXT_ENCODE: &str = "CLIPTextEncode";
const EMPTY_LATENT: &str = "EmptyLatentImage";
const KSAMPLER: &str = "KSampler";
const VAE_DECODE: &str = "VAEDecode";
const VAE_ENCODE: &str = "VAEEncode";
const LOAD_IMAGE: &str = "LoadImage";
const LORA_LOADER: &str = "LoraLoader";
const CONTROLNET_LOADER: &str = "ControlNetLoader";
const CONTROLNET_APPLY: &str = "ControlNetApplyAdvanced";

/// Node that sends finished images over the socket.
pub const OUTPUT_NODE_CLASS: &str = "SaveImageWebsocket";

// ---------------------------------------------------------------------------
// Graph
// ---------------------------------------------------------------------------

/// A single node of a workflow graph.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WorkflowNode {
    pub id: String,
    pub class_type: String,
    pub inputs: Map<String, Value>,
}

/// Ordered set of nodes ready for submission.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WorkflowGraph {
    nodes: Vec<WorkflowNode>,
}

/// Output slot reference `[node_id, slot]`.
type Link = (String, u32);

fn link((node, slot): &Link) -> Value {
    json!([node, slot])
}

impl WorkflowGraph {
    pub fn nodes(&self) -> &[WorkflowNode] {
        &self.nodes
    }

    /// Class types in node order.
    pub fn class_types(&self) -> Vec<&str> {
        self.nodes.iter().map(|n| n.class_type.as_str()).collect()
    }

    pub fn node(&self, id: &str) -> Option<&WorkflowNode> {
        self.nodes.iter().find(|n| n.id == id)
    }

    /// First node of the given class.
    pub fn find(&self, class_type: &str) -> Option<&WorkflowNode> {
        self.nodes.iter().find(|n| n.class_type == class_type)
    }

    /// Id of the node whose images stream back over the socket.
    pub fn output_node_id(&self) -> Option<&str> {
        self.find(OUTPUT_NODE_CLASS).map(|n| n.id.as_str())
    }

    /// API-format JSON: `{"<id>": {"class_type": ..., "inputs": {...}}}`.
    pub fn to_prompt_json(&self) -> Value {
        let nodes = self
            .nodes
            .iter()
            .map(|n| {
                (
                    n.id.clone(),
                    json!({"class_type": n.class_type, "inputs": n.inputs}),
                )
            })
            .collect::<Map<_, _>>();
        Value::Object(nodes)
    }

    /// SHA-256 of the canonical prompt JSON.
    pub fn fingerprint(&self) -> String {
        json_fingerprint(&self.to_prompt_json())
    }

    fn add(&mut self, class_type: &str, inputs: Value) -> String {
        let id = (self.nodes.len() + 1).to_string();
        let inputs = match inputs {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        self.nodes.push(WorkflowNode {
            id: id.clone(),
            class_type: class_type.to_string(),
            inputs,
        });
        id
    }

    /// Compile a spec. `uploaded_name` replaces the input image's local
    /// name in `LoadImage` nodes once it is stored on the backend.
    pub fn compile(spec: &PipelineSpec, uploaded_name: Option<&str>) -> Self {
        let base = spec.base();
        let attachments = spec.attachments();
        let mut g = Self::default();

        let ckpt = g.add(CHECKPOINT_LOADER, json!({"ckpt_name": base.model_id}));
        let mut model: Link = (ckpt.clone(), 0);
        let mut clip: Link = (ckpt.clone(), 1);
        let vae: Link = (ckpt, 2);

        for attachment in attachments {
            if let Attachment::StyleAdapter { name, strength } = attachment {
                let lora = g.add(
                    LORA_LOADER,
                    json!({
                        "lora_name": name,
                        "strength_model": strength,
                        "strength_clip": strength,
                        "model": link(&model),
                        "clip": link(&clip),
                    }),
                );
                model = (lora.clone(), 0);
                clip = (lora, 1);
            }
        }

        let pos = g.add(
            CLIP_TEXT_ENCODE,
            json!({"text": base.positive_prompt, "clip": link(&clip)}),
        );
        let neg = g.add(
            CLIP_TEXT_ENCODE,
            json!({"text": base.negative_prompt, "clip": link(&clip)}),
        );
        let mut positive: Link = (pos, 0);
        let mut negative: Link = (neg, 0);

        let mut loaded_image: Option<Link> = None;
        let mut load_image = |g: &mut Self, local_name: &str| -> Link {
            if let Some(existing) = &loaded_image {
                return existing.clone();
            }
            let id = g.add(
                LOAD_IMAGE,
                json!({"image": uploaded_name.unwrap_or(local_name)}),
            );
            let l = (id, 0);
            loaded_image = Some(l.clone());
            l
        };

        for attachment in attachments {
            if let Attachment::ControlAdapter {
                name,
                image,
                strength,
            } = attachment
            {
                let pixels = load_image(&mut g, &image.name);
                let loader = g.add(CONTROLNET_LOADER, json!({"control_net_name": name}));
                let apply = g.add(
                    CONTROLNET_APPLY,
                    json!({
                        "positive": link(&positive),
                        "negative": link(&negative),
                        "control_net": link(&(loader, 0)),
                        "image": link(&pixels),
                        "strength": strength,
                        "start_percent": 0.0,
                        "end_percent": 1.0,
                    }),
                );
                positive = (apply.clone(), 0);
                negative = (apply, 1);
            }
        }

        let source = attachments.iter().find_map(|a| match a {
            Attachment::InputImage { image } => Some(image),
            _ => None,
        });
        let latent: Link = match source {
            Some(image) => {
                let pixels = load_image(&mut g, &image.name);
                let encoded = g.add(
                    VAE_ENCODE,
                    json!({"pixels": link(&pixels), "vae": link(&vae)}),
                );
                (encoded, 0)
            }
            None => {
                let empty = g.add(
                    EMPTY_LATENT,
                    json!({"width": base.width, "height": base.height, "batch_size": 1}),
                );
                (empty, 0)
            }
        };

        let sampler = g.add(
            KSAMPLER,
            json!({
                "seed": base.seed,
                "steps": base.steps,
                "cfg": base.guidance,
                "sampler_name": base.sampler,
                "scheduler": base.scheduler,
                "denoise": base.denoise,
                "model": link(&model),
                "positive": link(&positive),
                "negative": link(&negative),
                "latent_image": link(&latent),
            }),
        );
        let decoded = g.add(
            VAE_DECODE,
            json!({"samples": link(&(sampler, 0)), "vae": link(&vae)}),
        );
        g.add(OUTPUT_NODE_CLASS, json!({"images": link(&(decoded, 0))}));
        g
    }
}
