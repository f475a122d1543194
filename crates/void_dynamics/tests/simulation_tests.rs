//! End-to-end simulation scenarios driven through `PhysicsSystem::update`

use approx::assert_relative_eq;
use parking_lot::Mutex;
use std::sync::Arc;
use void_dynamics::prelude::*;

const DT: f32 = 1.0 / 60.0;

fn inline_system(config: PhysicsConfig) -> (PhysicsSystem, Scene) {
    let mut scene = Scene::new();
    let mut system = PhysicsSystem::with_executor(config, Arc::new(InlineExecutor));
    system.init(&mut scene).unwrap();
    (system, scene)
}

fn spawn_ground(scene: &mut Scene) -> hecs::Entity {
    scene.spawn((
        Transform::default(),
        PhysicsBody::rigid(RigidBodyDef::fixed(ShapeDesc::plane())),
    ))
}

fn spawn_ball(scene: &mut Scene, position: Vec3) -> hecs::Entity {
    scene.spawn((
        Transform::from_translation(position),
        PhysicsBody::rigid(RigidBodyDef::dynamic(ShapeDesc::sphere(0.5))),
    ))
}

fn body_id(scene: &Scene, entity: hecs::Entity) -> BodyId {
    scene.get::<PhysicsBody>(entity).unwrap().body_id().unwrap()
}

fn collector(system: &mut PhysicsSystem) -> Arc<Mutex<EventCollector>> {
    let collector = Arc::new(Mutex::new(EventCollector::new()));
    system.add_shared_listener(collector.clone());
    collector
}

/// Every pair's history must read Enter, Stay*, Exit, Enter, ...
fn assert_monotonic(history: &[CollisionEventKind]) {
    let mut touching = false;
    for (i, kind) in history.iter().enumerate() {
        match kind {
            CollisionEventKind::Enter => assert!(!touching, "second Enter at {i}: {history:?}"),
            CollisionEventKind::Stay => assert!(touching, "Stay without Enter at {i}: {history:?}"),
            CollisionEventKind::Exit => assert!(touching, "Exit without Enter at {i}: {history:?}"),
        }
        touching = *kind != CollisionEventKind::Exit;
    }
}

#[test]
fn test_basic_drop() {
    let (mut system, mut scene) = inline_system(PhysicsConfig::default());
    let events = collector(&mut system);
    let ground = spawn_ground(&mut scene);
    let ball = spawn_ball(&mut scene, Vec3::new(0.0, 10.0, 0.0));
    system.update(&mut scene, 0.0).unwrap();

    let mut last_y = 10.0;
    for _ in 0..30 {
        system.update(&mut scene, DT).unwrap();
        let y = scene.get::<Transform>(ball).unwrap().translation().y;
        assert!(y < last_y, "ball should be falling");
        last_y = y;
    }
    for _ in 0..240 {
        system.update(&mut scene, DT).unwrap();
    }

    let y = scene.get::<Transform>(ball).unwrap().translation().y;
    assert_relative_eq!(y, 0.5, epsilon = 0.05);

    let history = events.lock().history(body_id(&scene, ground), body_id(&scene, ball));
    assert_eq!(history.first(), Some(&CollisionEventKind::Enter));
    assert_eq!(
        history.iter().filter(|k| **k == CollisionEventKind::Enter).count(),
        1
    );
    assert!(history.contains(&CollisionEventKind::Stay));
    assert_monotonic(&history);
}

#[test]
fn test_basic_drop_on_worker_threads() {
    let mut scene = Scene::new();
    let executor = Arc::new(RayonExecutor::new(2).unwrap());
    let mut system = PhysicsSystem::with_executor(PhysicsConfig::default(), executor);
    system.init(&mut scene).unwrap();
    assert_eq!(system.max_concurrency(), 2);

    let events = collector(&mut system);
    let ground = spawn_ground(&mut scene);
    let ball = spawn_ball(&mut scene, Vec3::new(0.0, 2.0, 0.0));
    system.update(&mut scene, 0.0).unwrap();
    for _ in 0..120 {
        system.update(&mut scene, DT).unwrap();
    }

    let history = events.lock().history(body_id(&scene, ground), body_id(&scene, ball));
    assert_eq!(history.first(), Some(&CollisionEventKind::Enter));
    assert_monotonic(&history);
    system.shutdown(&mut scene);
}

#[test]
fn test_step_count_independent_of_frame_chunking() {
    let run = |frames: &[f32]| {
        let (mut system, mut scene) = inline_system(PhysicsConfig::default());
        spawn_ground(&mut scene);
        let ball = spawn_ball(&mut scene, Vec3::new(0.0, 3.0, 0.0));
        system.update(&mut scene, 0.0).unwrap();
        for dt in frames {
            system.update(&mut scene, *dt).unwrap();
        }
        let position = scene.get::<PhysicsBody>(ball).unwrap().position();
        (system.step_count(), position)
    };

    // 60.5 fixed steps worth of time, chunked three ways
    let total = DT * 60.5;
    let even = vec![total / 121.0; 121];
    let coarse = vec![total / 11.0; 11];
    let uneven: Vec<f32> = {
        let pattern = [0.004, 0.011, 0.002, 0.031, 0.017];
        let mut frames = Vec::new();
        let mut left = total;
        for dt in pattern.iter().cycle() {
            if left <= *dt {
                frames.push(left);
                break;
            }
            frames.push(*dt);
            left -= dt;
        }
        frames
    };

    let (steps_even, pos_even) = run(&even);
    let (steps_coarse, pos_coarse) = run(&coarse);
    let (steps_uneven, pos_uneven) = run(&uneven);
    assert_eq!(steps_even, 60);
    assert_eq!(steps_coarse, 60);
    assert_eq!(steps_uneven, 60);
    assert!(pos_even.abs_diff_eq(pos_coarse, 1.0e-6));
    assert!(pos_even.abs_diff_eq(pos_uneven, 1.0e-6));
}

#[test]
fn test_lazy_creation_idempotent() {
    let (mut system, mut scene) = inline_system(PhysicsConfig::default());
    let degenerate = Transform::from_scale_rotation_translation(Vec3::ZERO, Quat::IDENTITY, Vec3::Y);
    let body_entity = scene.spawn((
        degenerate,
        PhysicsBody::rigid(RigidBodyDef::dynamic(ShapeDesc::sphere(0.5))),
    ));
    let character_entity = scene.spawn((degenerate, CharacterController::new(CharacterDef::default())));

    for _ in 0..5 {
        system.update(&mut scene, DT).unwrap();
    }
    assert_eq!(system.body_count(), 0);
    assert_eq!(system.character_count(), 0);

    for entity in [body_entity, character_entity] {
        scene
            .get_mut::<Transform>(entity)
            .unwrap()
            .set_local_matrix(Mat4::from_translation(Vec3::new(0.0, 5.0, 0.0)));
    }
    system.update(&mut scene, DT).unwrap();
    let body = scene.get::<PhysicsBody>(body_entity).unwrap().body_id();
    let character = scene.get::<CharacterController>(character_entity).unwrap().handle();
    assert!(body.is_some());
    assert!(character.is_some());

    for _ in 0..5 {
        system.update(&mut scene, DT).unwrap();
    }
    assert_eq!(scene.get::<PhysicsBody>(body_entity).unwrap().body_id(), body);
    assert_eq!(
        scene.get::<CharacterController>(character_entity).unwrap().handle(),
        character
    );
    assert_eq!(system.body_count(), 1);
    assert_eq!(system.character_count(), 1);
}

#[test]
fn test_pause_freezes_simulation() {
    let (mut system, mut scene) = inline_system(PhysicsConfig::default());
    let events = collector(&mut system);
    spawn_ground(&mut scene);
    let ball = spawn_ball(&mut scene, Vec3::new(0.0, 5.0, 0.0));
    system.update(&mut scene, 0.0).unwrap();
    system.update(&mut scene, DT).unwrap();
    let steps = system.step_count();
    let y = scene.get::<Transform>(ball).unwrap().translation().y;

    system.set_paused(true);
    assert!(system.is_paused());
    for _ in 0..60 {
        system.update(&mut scene, DT).unwrap();
    }
    assert_eq!(system.step_count(), steps);
    assert_eq!(scene.get::<Transform>(ball).unwrap().translation().y, y);
    assert!(events.lock().events.is_empty());

    system.set_paused(false);
    system.update(&mut scene, DT).unwrap();
    assert_eq!(system.step_count(), steps + 1);
    assert!(scene.get::<Transform>(ball).unwrap().translation().y < y);
}

#[test]
fn test_paused_update_drains_queued_events() {
    let config = PhysicsConfig::default().with_capacity(16, 1, 64);
    let (mut system, mut scene) = inline_system(config);
    let events = collector(&mut system);
    let ground = spawn_ground(&mut scene);
    let left = spawn_ball(&mut scene, Vec3::new(-5.0, 0.45, 0.0));
    let right = spawn_ball(&mut scene, Vec3::new(5.0, 0.45, 0.0));
    system.update(&mut scene, 0.0).unwrap();

    // The overflowing step returns before its contacts are dispatched
    assert!(system.update(&mut scene, DT).unwrap_err().is_capacity());
    assert!(events.lock().events.is_empty());

    system.set_paused(true);
    let steps = system.step_count();
    system.update(&mut scene, DT).unwrap();
    assert_eq!(system.step_count(), steps);
    assert_eq!(system.last_frame().events, 2);

    let ground_id = body_id(&scene, ground);
    let events = events.lock();
    for ball in [left, right] {
        assert_eq!(
            events.history(ground_id, body_id(&scene, ball)),
            vec![CollisionEventKind::Enter]
        );
    }
}

#[test]
fn test_capacity_overflow_is_fatal() {
    let config = PhysicsConfig::default().with_capacity(16, 1, 64);
    let (mut system, mut scene) = inline_system(config);
    spawn_ground(&mut scene);
    spawn_ball(&mut scene, Vec3::new(-5.0, 0.45, 0.0));
    spawn_ball(&mut scene, Vec3::new(5.0, 0.45, 0.0));
    system.update(&mut scene, 0.0).unwrap();

    let err = system.update(&mut scene, DT).unwrap_err();
    assert!(err.is_capacity());
    assert!(matches!(err, PhysicsError::CapacityExceeded { limit: 1, actual: 2, .. }));
}

#[test]
fn test_max_bodies_reported_from_update() {
    let config = PhysicsConfig::default().with_capacity(1, 16, 16);
    let (mut system, mut scene) = inline_system(config);
    spawn_ball(&mut scene, Vec3::new(0.0, 5.0, 0.0));
    spawn_ball(&mut scene, Vec3::new(3.0, 5.0, 0.0));
    let err = system.update(&mut scene, 0.0).unwrap_err();
    assert!(err.is_capacity());
    assert_eq!(system.body_count(), 1);
}

#[test]
fn test_bouncing_bodies_keep_event_order() {
    let (mut system, mut scene) = inline_system(PhysicsConfig::default());
    let events = collector(&mut system);
    let ground = spawn_ground(&mut scene);
    let balls: Vec<_> = (0..4)
        .map(|i| {
            let def = RigidBodyDef::dynamic(ShapeDesc::sphere(0.5))
                .with_material(PhysicsMaterial::rubber());
            scene.spawn((
                Transform::from_translation(Vec3::new(i as f32 * 3.0, 2.0 + i as f32, 0.0)),
                PhysicsBody::rigid(def),
            ))
        })
        .collect();
    system.update(&mut scene, 0.0).unwrap();
    for _ in 0..300 {
        system.update(&mut scene, DT).unwrap();
    }

    let ground_id = body_id(&scene, ground);
    let events = events.lock();
    for ball in balls {
        let history = events.history(ground_id, body_id(&scene, ball));
        assert!(!history.is_empty());
        assert_monotonic(&history);
    }
}

#[test]
fn test_despawn_during_contact_emits_exit() {
    let (mut system, mut scene) = inline_system(PhysicsConfig::default());
    let events = collector(&mut system);
    let ground = spawn_ground(&mut scene);
    let ball = spawn_ball(&mut scene, Vec3::new(0.0, 0.45, 0.0));
    system.update(&mut scene, 0.0).unwrap();
    system.update(&mut scene, DT).unwrap();
    let (ground_id, ball_id) = (body_id(&scene, ground), body_id(&scene, ball));

    scene.despawn(ball).unwrap();
    system.update(&mut scene, DT).unwrap();
    let history = events.lock().history(ground_id, ball_id);
    assert_eq!(history.last(), Some(&CollisionEventKind::Exit));
    assert_monotonic(&history);
}

#[test]
fn test_kinematic_body_follows_entity() {
    let (mut system, mut scene) = inline_system(PhysicsConfig::default());
    let platform = scene.spawn((
        Transform::default(),
        PhysicsBody::rigid(RigidBodyDef::kinematic(ShapeDesc::cuboid(1.0, 0.1, 1.0))),
    ));
    system.update(&mut scene, 0.0).unwrap();

    let target = Vec3::new(2.0, 1.0, -3.0);
    scene
        .get_mut::<Transform>(platform)
        .unwrap()
        .set_local_matrix(Mat4::from_translation(target));
    system.update(&mut scene, DT).unwrap();
    system.update(&mut scene, DT).unwrap();

    let position = scene.get::<PhysicsBody>(platform).unwrap().position();
    assert!(position.abs_diff_eq(target, 1.0e-4), "{position}");
}

#[test]
fn test_character_walks_on_ground() {
    let (mut system, mut scene) = inline_system(PhysicsConfig::default());
    spawn_ground(&mut scene);
    let walker = scene.spawn((
        Transform::from_translation(Vec3::new(0.0, 1.3, 0.0)),
        CharacterController::new(CharacterDef::default()),
    ));
    for _ in 0..30 {
        system.update(&mut scene, DT).unwrap();
    }
    assert_eq!(
        scene.get::<CharacterController>(walker).unwrap().ground_state(),
        GroundState::Grounded
    );

    for _ in 0..60 {
        scene
            .get::<CharacterController>(walker)
            .unwrap()
            .set_linear_velocity(Vec3::new(2.0, 0.0, 0.0));
        system.update(&mut scene, DT).unwrap();
    }
    let character = scene.get::<CharacterController>(walker).unwrap();
    let x = scene.get::<Transform>(walker).unwrap().translation().x;
    assert!(x > 1.5, "walked {x}");
    assert!((character.position().x - x).abs() < 1.0e-4);
    assert!(character.is_supported());
}

#[test]
fn test_character_coupled_to_body() {
    let (mut system, mut scene) = inline_system(PhysicsConfig::default());
    spawn_ground(&mut scene);
    let entity = scene.spawn((
        Transform::from_translation(Vec3::new(1.0, 3.0, 2.0)),
        PhysicsBody::character(CharacterBodyDef::default()),
        CharacterController::new(CharacterDef::default()),
    ));

    for _ in 0..90 {
        system.update(&mut scene, DT).unwrap();
        let body = scene.get::<PhysicsBody>(entity).unwrap();
        let character = scene.get::<CharacterController>(entity).unwrap();
        assert!(character.position().abs_diff_eq(body.position(), 1.0e-5));
        let transform = scene.get::<Transform>(entity).unwrap().translation();
        assert!(transform.abs_diff_eq(body.position(), 1.0e-4));
    }

    let character = scene.get::<CharacterController>(entity).unwrap();
    assert!(character
        .active_contacts()
        .iter()
        .all(|c| c.body != scene.get::<PhysicsBody>(entity).unwrap().body_id()));
    assert!(character.is_supported());
}

#[test]
fn test_activate_bodies_wakes_region() {
    let (mut system, mut scene) = inline_system(PhysicsConfig::default());
    spawn_ground(&mut scene);
    let ball = spawn_ball(&mut scene, Vec3::new(0.0, 0.5, 0.0));
    system.update(&mut scene, 0.0).unwrap();
    scene.get::<PhysicsBody>(ball).unwrap().sleep();
    assert!(scene.get::<PhysicsBody>(ball).unwrap().is_sleeping());

    let bounds = Bounds::from_center_half_extents(Vec3::new(0.0, 0.5, 0.0), Vec3::splat(1.0));
    assert_eq!(system.activate_bodies(bounds, LayerMask::ALL), 1);
    assert!(!scene.get::<PhysicsBody>(ball).unwrap().is_sleeping());
}

#[test]
fn test_config_from_json_drives_system() {
    let config = PhysicsConfig::from_json_str(r#"{ "gravity": [0.0, 0.0, 0.0], "fixed_step": 0.02 }"#).unwrap();
    let (mut system, mut scene) = inline_system(config);
    let ball = spawn_ball(&mut scene, Vec3::new(0.0, 5.0, 0.0));
    system.update(&mut scene, 0.0).unwrap();
    system.update(&mut scene, 0.1).unwrap();
    assert_eq!(system.step_count(), 5);
    assert_eq!(system.gravity(), Vec3::ZERO);
    let y = scene.get::<PhysicsBody>(ball).unwrap().position().y;
    assert_relative_eq!(y, 5.0, epsilon = 1.0e-5);
}
