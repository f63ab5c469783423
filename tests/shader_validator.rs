use std::fs;
use std::path::Path;

use gridflow::stage::{compose_shader, COMMON_WGSL};
use gridflow::StageKind;

fn validate_source(name: &str, source: &str, errors: &mut Vec<String>) -> Option<naga::Module> {
    let module = match naga::front::wgsl::parse_str(source) {
        Ok(module) => module,
        Err(e) => {
            errors.push(format!("Failed to parse {name}:\n{}", e.emit_to_string(source)));
            return None;
        }
    };

    let mut validator = naga::valid::Validator::new(
        naga::valid::ValidationFlags::all(),
        naga::valid::Capabilities::all(),
    );

    if let Err(e) = validator.validate(&module) {
        errors.push(format!("Failed to validate {name}:\n{e:?}"));
        return None;
    }
    Some(module)
}

#[test]
fn validate_stage_programs() {
    let mut errors = Vec::new();
    validate_source("common.wgsl", COMMON_WGSL, &mut errors);

    for stage in StageKind::ALL {
        let source = compose_shader(stage);
        if let Some(module) = validate_source(stage.label(), &source, &mut errors) {
            let entry = module.entry_points.iter().find(|e| e.name == "main");
            match entry {
                Some(e) if e.workgroup_size == gridflow::grid::WORKGROUP_SIZE => {}
                Some(e) => errors.push(format!("{stage}: workgroup size {:?}", e.workgroup_size)),
                None => errors.push(format!("{stage}: no `main` entry point")),
            }
        }
    }

    if !errors.is_empty() {
        panic!("Shader validation failed:\n{}", errors.join("\n"));
    }
}

#[test]
fn validate_view_shader() {
    let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("shaders/volume_view.wgsl");
    let source = fs::read_to_string(&path).unwrap();
    let mut errors = Vec::new();
    let module = validate_source("volume_view.wgsl", &source, &mut errors);
    if !errors.is_empty() {
        panic!("Shader validation failed:\n{}", errors.join("\n"));
    }
    let module = module.unwrap();
    let names: Vec<&str> = module.entry_points.iter().map(|e| e.name.as_str()).collect();
    assert!(names.contains(&"vs_main"));
    assert!(names.contains(&"fs_main"));
}
