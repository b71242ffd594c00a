// =============================================================================
// VILLA DEMO - click to spawn triangles
// =============================================================================
//
// A fixed triangle drawn from hand-managed vertex/index buffers, plus one
// small mesh per left click. The arrow keys move everything through a
// uniform offset.
//
// CONTROLS (config.toml [controls]):
//   Left click      spawn a triangle under the cursor
//   Backspace       remove the most recent triangle
//   Arrow keys      move the scene
//   F11             toggle fullscreen
//   Escape          quit
//
// =============================================================================

use anyhow::Result;
use bytemuck::{Pod, Zeroable};
use glam::{Vec2, Vec3};
use std::mem::offset_of;
use winit::keyboard::KeyCode;

use villa::backend::{Index, PipelineDesc, UniformBinding, Vertex, VertexAttribute};
use villa::{logging, Config, Game, MeshKey};

/// Staging space for every upload the demo makes
const STAGING_SIZE: u64 = 64 * 1024;

/// Half-size of a spawned triangle, in clip space
const SPAWN_SIZE: f32 = 0.01;

/// Offset change per second while an arrow key is held
const MOVE_SPEED: f32 = 0.5;

#[repr(C)]
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
struct TriangleVertex {
    pos: Vec2,
    color: Vec3,
}

impl Vertex for TriangleVertex {
    const ATTRIBUTES: &'static [VertexAttribute] = &[
        VertexAttribute::vec2(offset_of!(TriangleVertex, pos)),
        VertexAttribute::vec3(offset_of!(TriangleVertex, color)),
    ];
}

fn main() -> Result<()> {
    let config = Config::load();
    logging::init(&config.debug);
    log::info!("Starting villa demo");

    let controls = config.controls;
    let mut game = Game::new(config)?;

    // ─────────────────────────────────────────────────────────────────────────
    // PIPELINE + UNIFORM OFFSET
    // ─────────────────────────────────────────────────────────────────────────
    let pipeline = game.create_pipeline::<TriangleVertex>(&PipelineDesc {
        vertex_shader: "shaders/triangle.vert.spv".into(),
        fragment_shader: "shaders/triangle.frag.spv".into(),
        uniforms: vec![UniformBinding::vertex(0)],
    })?;

    let mut staging_buffer = game.create_staging_buffer(STAGING_SIZE)?;
    let mut uniform_buffer = game.create_uniform_buffer::<Vec2>(1)?;
    let mut descriptor_pool = game.create_descriptor_pool(&pipeline)?;
    let descriptor_set = descriptor_pool.allocate(&uniform_buffer)?;

    let mut offset = Vec2::new(0.1, 0.1);
    uniform_buffer.upload(&[offset])?;

    // ─────────────────────────────────────────────────────────────────────────
    // BASE TRIANGLE (explicit staging uploads)
    // ─────────────────────────────────────────────────────────────────────────
    let vertices = [
        TriangleVertex {
            pos: Vec2::new(0.0, -0.5),
            color: Vec3::new(1.0, 0.0, 0.0),
        },
        TriangleVertex {
            pos: Vec2::new(0.5, 0.5),
            color: Vec3::new(0.0, 1.0, 0.0),
        },
        TriangleVertex {
            pos: Vec2::new(-0.5, 0.5),
            color: Vec3::new(0.0, 0.0, 1.0),
        },
    ];
    let indices: [Index; 3] = [0, 1, 2];

    let vertex_buffer = game.create_vertex_buffer::<TriangleVertex>(vertices.len())?;
    let index_buffer = game.create_index_buffer(indices.len())?;

    staging_buffer.upload(&vertices)?;
    game.buffer_copy(&staging_buffer, &vertex_buffer)?;
    staging_buffer.upload(&indices)?;
    game.buffer_copy(&staging_buffer, &index_buffer)?;

    // ─────────────────────────────────────────────────────────────────────────
    // MAIN LOOP
    // ─────────────────────────────────────────────────────────────────────────
    let mut spawned: Vec<MeshKey> = Vec::new();
    let mut spawn_count = 0u32;
    let mut undo_held = false;
    let mut fullscreen_held = false;

    while game.poll() {
        if game.is_key_down(controls.quit_key) {
            log::info!("{:?} pressed, exiting...", controls.quit_key);
            break;
        }

        let fullscreen_down = game.is_key_down(controls.fullscreen_key);
        if fullscreen_down && !fullscreen_held {
            game.window_mut().toggle_fullscreen();
        }
        fullscreen_held = fullscreen_down;

        let undo_down = game.is_key_down(controls.undo_key);
        if undo_down && !undo_held {
            if let Some(key) = spawned.pop() {
                game.release_mesh(key);
            }
        }
        undo_held = undo_down;

        if game.left_clicked_now() && game.width() > 0 && game.height() > 0 {
            // Window pixels -> clip space, minus the offset the shader adds back
            let cursor = Vec2::new(
                game.mouse_x() / game.width() as f32 * 2.0 - 1.0,
                game.mouse_y() / game.height() as f32 * 2.0 - 1.0,
            ) - offset;

            let triangle = spawn_triangle(cursor, spawn_count);
            spawned.push(game.create_mesh(&triangle, &[0, 1, 2])?);
            spawn_count += 1;
        }

        let movement = arrow_direction(&game) * MOVE_SPEED * game.delta();
        if movement != Vec2::ZERO {
            offset += movement;
            uniform_buffer.upload(&[offset])?;
        }

        if game.begin_draw(&pipeline, descriptor_set)? {
            game.draw(&vertex_buffer, &index_buffer);
            for &key in &spawned {
                game.draw_mesh(key);
            }
            game.end_draw()?;
        }
    }

    game.wait_idle()?;
    log::info!(
        "Spawned {} triangles, {} still alive",
        spawn_count,
        game.mesh_count()
    );

    Ok(())
}

fn spawn_triangle(center: Vec2, seed: u32) -> [TriangleVertex; 3] {
    let corners = [
        Vec2::new(0.0, -SPAWN_SIZE),
        Vec2::new(SPAWN_SIZE, SPAWN_SIZE),
        Vec2::new(-SPAWN_SIZE, SPAWN_SIZE),
    ];
    let mut corner = 0;
    corners.map(|delta| {
        corner += 1;
        TriangleVertex {
            pos: center + delta,
            color: palette(seed * 3 + corner),
        }
    })
}

/// Well-spread colors from a counter (golden-ratio hue steps)
fn palette(n: u32) -> Vec3 {
    let h = (n as f32 * 0.618_034).fract() * 6.0;
    Vec3::new(
        ((h - 3.0).abs() - 1.0).clamp(0.0, 1.0),
        (2.0 - (h - 2.0).abs()).clamp(0.0, 1.0),
        (2.0 - (h - 4.0).abs()).clamp(0.0, 1.0),
    )
}

fn arrow_direction(game: &Game) -> Vec2 {
    let mut direction = Vec2::ZERO;
    if game.is_key_down(KeyCode::ArrowLeft) {
        direction.x -= 1.0;
    }
    if game.is_key_down(KeyCode::ArrowRight) {
        direction.x += 1.0;
    }
    if game.is_key_down(KeyCode::ArrowUp) {
        direction.y -= 1.0;
    }
    if game.is_key_down(KeyCode::ArrowDown) {
        direction.y += 1.0;
    }
    direction
}
