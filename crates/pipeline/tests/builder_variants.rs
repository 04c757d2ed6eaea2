use imagegen_core::generation::{GenerationOptions, InputImage};
use imagegen_core::model_defaults::heuristic_defaults;
use imagegen_core::resolution::ResolutionChoice;
use imagegen_pipeline::{build, BuilderVariant, PipelineSpec};

fn options(image: bool, control: bool, style: bool) -> GenerationOptions {
    let model = "flux1-dev.safetensors";
    let mut options =
        GenerationOptions::from_parameters(model, "studio portrait", &heuristic_defaults(model));
    options.seed = Some(1234);
    if image {
        options.input_image = Some(InputImage {
            name: "ref.png".into(),
            bytes: vec![9, 9, 9],
        });
    }
    if control {
        options.control_adapter = Some("depth.safetensors".into());
    }
    if style {
        options.style_adapter = Some("film_grain.safetensors".into());
    }
    options
}

#[test]
fn variant_follows_attachment_presence() {
    for image in [false, true] {
        for control in [false, true] {
            for style in [false, true] {
                let spec = build(&options(image, control, style)).unwrap();
                let expected = if image || control || style {
                    BuilderVariant::Extended
                } else {
                    BuilderVariant::Minimal
                };
                assert_eq!(
                    spec.variant(),
                    expected,
                    "image={image} control={control} style={style}"
                );
            }
        }
    }
}

#[test]
fn minimal_spec_never_carries_attachments() {
    let spec = build(&options(false, false, false)).unwrap();
    match spec {
        PipelineSpec::Minimal(_) => assert!(spec.attachments().is_empty()),
        PipelineSpec::Extended(_) => panic!("expected minimal variant"),
    }
}

#[test]
fn same_options_and_seed_build_identical_specs() {
    for (image, control, style) in [(false, false, false), (true, true, true), (false, false, true)] {
        let opts = options(image, control, style);
        let a = build(&opts).unwrap();
        let b = build(&opts).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.to_graph(None), b.to_graph(None));
        assert_eq!(a.fingerprint(), b.fingerprint());
    }
}

#[test]
fn custom_resolution_never_yields_zero_dimensions() {
    for (w, h) in [(1, 1), (640, 480), (512, 1536), (8192, 8192), (0, 512), (512, 0)] {
        let mut opts = options(false, false, false);
        opts.resolution = ResolutionChoice::Custom;
        opts.custom_width = Some(w);
        opts.custom_height = Some(h);

        match build(&opts) {
            Ok(spec) => {
                let graph = spec.to_graph(None);
                let latent = graph.find("EmptyLatentImage").unwrap();
                assert_eq!(latent.inputs["width"], serde_json::json!(w));
                assert_eq!(latent.inputs["height"], serde_json::json!(h));
                assert!(spec.base().width > 0 && spec.base().height > 0);
            }
            Err(_) => assert!(w == 0 || h == 0, "{w}x{h} should build"),
        }
    }
}

#[test]
fn fingerprint_is_taken_after_custom_substitution() {
    let mut custom = options(false, false, false);
    custom.resolution = ResolutionChoice::Custom;
    custom.custom_width = Some(1024);
    custom.custom_height = Some(1024);
    let fixed = options(false, false, false);

    assert_eq!(
        build(&custom).unwrap().fingerprint(),
        build(&fixed).unwrap().fingerprint()
    );
}
