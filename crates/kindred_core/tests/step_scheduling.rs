//! # Step Scheduling Tests
//!
//! Verifies the step state machine:
//!
//! 1. **Isolation**: changes recorded by systems apply at the next step
//! 2. **Ordering**: systems of a timeline run in registration order, and
//!    timelines are independent
//! 3. **Failure**: a failing system or command aborts the step without
//!    rolling back work already done
//! 4. **Manifests**: systems declared in TOML are bound by name
//!
//! Run with: cargo test --package kindred_core --test step_scheduling

use std::cell::RefCell;
use std::rc::Rc;

use kindred_core::{
    Component, ComponentMask, EcsError, EcsResult, EntityId, QueryItem, Read, StepContext,
    System, SystemFactory, SystemManifest, World, WorldConfig, Write,
};

#[derive(Debug, Clone, Copy, PartialEq)]
struct Position(f32);
impl Component for Position {
    const NAME: &'static str = "Position";
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct Velocity(f32);
impl Component for Velocity {
    const NAME: &'static str = "Velocity";
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct Lifetime(u32);
impl Component for Lifetime {
    const NAME: &'static str = "Lifetime";
}

/// Shared trace of which system touched which entity.
type Trace = Rc<RefCell<Vec<(&'static str, EntityId)>>>;

/// Counts visits, reads positions.
struct Observe {
    label: &'static str,
    trace: Trace,
}

impl System for Observe {
    type Query = (Read<Position>,);

    fn name(&self) -> &str {
        self.label
    }

    fn update(
        &mut self,
        _ctx: &mut StepContext<'_>,
        entity: EntityId,
        _item: QueryItem<'_, Self::Query>,
    ) -> EcsResult<()> {
        self.trace.borrow_mut().push((self.label, entity));
        Ok(())
    }
}

/// Destroys every member and spawns a replacement.
struct Reap;

impl System for Reap {
    type Query = (Read<Position>,);

    fn update(
        &mut self,
        ctx: &mut StepContext<'_>,
        entity: EntityId,
        item: QueryItem<'_, Self::Query>,
    ) -> EcsResult<()> {
        let (position,) = item;
        ctx.destroy(entity);
        let child = ctx.spawn();
        ctx.insert(child, Position(position.0 + 100.0));
        Ok(())
    }
}

/// Counts down and removes its own component at zero.
struct Expire;

impl System for Expire {
    type Query = (Write<Lifetime>,);

    fn update(
        &mut self,
        ctx: &mut StepContext<'_>,
        entity: EntityId,
        item: QueryItem<'_, Self::Query>,
    ) -> EcsResult<()> {
        let (lifetime,) = item;
        lifetime.0 = lifetime.0.saturating_sub(1);
        if lifetime.0 == 0 {
            ctx.remove::<Lifetime>(entity);
        }
        Ok(())
    }
}

/// Integrates velocity into position.
#[derive(Default)]
struct Integrate;

impl System for Integrate {
    type Query = (Write<Position>, Read<Velocity>);

    fn name(&self) -> &str {
        "integrate"
    }

    fn update(
        &mut self,
        ctx: &mut StepContext<'_>,
        _entity: EntityId,
        item: QueryItem<'_, Self::Query>,
    ) -> EcsResult<()> {
        let (position, velocity) = item;
        position.0 += velocity.0 * ctx.delta_time();
        Ok(())
    }
}

/// Fails on the entity whose position is negative.
struct Faulty {
    visited: Rc<RefCell<usize>>,
}

impl System for Faulty {
    type Query = (Write<Position>,);

    fn name(&self) -> &str {
        "faulty"
    }

    fn update(
        &mut self,
        _ctx: &mut StepContext<'_>,
        _entity: EntityId,
        item: QueryItem<'_, Self::Query>,
    ) -> EcsResult<()> {
        let (position,) = item;
        if position.0 < 0.0 {
            return Err(EcsError::system("negative position"));
        }
        position.0 += 1.0;
        *self.visited.borrow_mut() += 1;
        Ok(())
    }
}

fn spawn_with_position(world: &mut World, x: f32) -> EntityId {
    let entity = world.create_entity();
    world.add_component(entity, Position(x)).unwrap();
    entity
}

// ============================================================================
// ISOLATION
// ============================================================================

#[test]
fn test_commands_apply_next_step() {
    let mut world = World::new(WorldConfig::default());
    let trace: Trace = Rc::default();
    let original: Vec<_> = (0..3).map(|i| spawn_with_position(&mut world, i as f32)).collect();

    world.add_system("fixed", Reap).unwrap();
    world
        .add_system("fixed", Observe { label: "after", trace: Rc::clone(&trace) })
        .unwrap();

    let first = world.step("fixed", 0.0).unwrap();
    assert_eq!(first.spawned, 3);

    // The observer ran after Reap in the same step and still saw everyone.
    let seen: Vec<EntityId> = trace.borrow().iter().map(|&(_, e)| e).collect();
    assert_eq!(seen.len(), 3);
    for e in &original {
        assert!(seen.contains(e));
        assert!(world.is_alive(*e));
    }

    trace.borrow_mut().clear();
    let second = world.step("fixed", 0.0).unwrap();
    assert_eq!(second.commands, 9); // 3 x (destroy, spawn, insert)
    assert_eq!(second.spawned, 3);
    assert_eq!(second.destroyed, 3);

    for e in &original {
        assert!(!world.is_alive(*e));
    }
    let seen: Vec<EntityId> = trace.borrow().iter().map(|&(_, e)| e).collect();
    assert_eq!(seen.len(), 3);
    for e in &seen {
        assert!(!original.contains(e));
        assert!(world.get_component::<Position>(*e).unwrap().0 >= 100.0);
    }
}

#[test]
fn test_deferred_remove_changes_membership_next_step() {
    let mut world = World::new(WorldConfig::default());
    let entity = world.create_entity();
    world.add_component(entity, Lifetime(2)).unwrap();
    let system = world.add_system("fixed", Expire).unwrap();
    let family = world.binding_info(system).unwrap().family;

    world.step("fixed", 0.0).unwrap(); // 2 -> 1
    assert_eq!(world.get_component::<Lifetime>(entity).unwrap(), &Lifetime(1));

    world.step("fixed", 0.0).unwrap(); // 1 -> 0, removal queued
    assert!(world.family(family).unwrap().contains(entity));

    let report = world.step("fixed", 0.0).unwrap();
    assert_eq!(report.commands, 1);
    assert_eq!(report.removed, 1);
    assert!(!world.family(family).unwrap().contains(entity));
    assert!(world.is_alive(entity));
}

// ============================================================================
// ORDERING
// ============================================================================

#[test]
fn test_systems_run_in_registration_order_per_timeline() {
    let mut world = World::new(WorldConfig::default());
    let trace: Trace = Rc::default();
    let entity = spawn_with_position(&mut world, 0.0);

    for label in ["first", "second", "third"] {
        world
            .add_system("variable", Observe { label, trace: Rc::clone(&trace) })
            .unwrap();
    }
    world
        .add_system("render", Observe { label: "draw", trace: Rc::clone(&trace) })
        .unwrap();

    world.step("variable", 0.016).unwrap();
    assert_eq!(
        *trace.borrow(),
        vec![("first", entity), ("second", entity), ("third", entity)]
    );

    trace.borrow_mut().clear();
    world.step("render", 0.016).unwrap();
    assert_eq!(*trace.borrow(), vec![("draw", entity)]);
    assert_eq!(world.timeline_systems("variable").unwrap().len(), 3);
}

#[test]
fn test_step_context_reports_timing() {
    struct Clock(Rc<RefCell<Vec<(String, f32, u64)>>>);

    impl System for Clock {
        type Query = (Read<Position>,);

        fn update(
            &mut self,
            ctx: &mut StepContext<'_>,
            _entity: EntityId,
            _item: QueryItem<'_, Self::Query>,
        ) -> EcsResult<()> {
            self.0
                .borrow_mut()
                .push((ctx.timeline().to_string(), ctx.delta_time(), ctx.step()));
            Ok(())
        }
    }

    let mut world = World::new(WorldConfig::default());
    let ticks = Rc::new(RefCell::new(Vec::new()));
    spawn_with_position(&mut world, 0.0);
    world.add_system("fixed", Clock(Rc::clone(&ticks))).unwrap();

    world.step("fixed", 0.25).unwrap();
    world.step("render", 1.0).unwrap();
    world.step("fixed", 0.5).unwrap();

    assert_eq!(
        *ticks.borrow(),
        vec![("fixed".to_string(), 0.25, 1), ("fixed".to_string(), 0.5, 3)]
    );
}

// ============================================================================
// FAILURE
// ============================================================================

#[test]
fn test_failing_system_aborts_step_without_rollback() {
    let mut world = World::new(WorldConfig::default());
    let trace: Trace = Rc::default();
    let visited = Rc::new(RefCell::new(0));

    let good = spawn_with_position(&mut world, 1.0);
    let bad = spawn_with_position(&mut world, -1.0);
    let doomed = spawn_with_position(&mut world, 5.0);
    world.step("fixed", 0.0).unwrap();

    world
        .add_system("fixed", Faulty { visited: Rc::clone(&visited) })
        .unwrap();
    world
        .add_system("fixed", Observe { label: "late", trace: Rc::clone(&trace) })
        .unwrap();
    world.destroy_entity(doomed).unwrap();

    let err = world.step("fixed", 0.0).unwrap_err();
    match &err {
        EcsError::StepAborted { timeline, phase, origin, source } => {
            assert_eq!(timeline, "fixed");
            assert_eq!(*phase, "Update");
            assert_eq!(origin, "faulty");
            assert!(matches!(**source, EcsError::System(_)));
        }
        other => panic!("unexpected error: {other}"),
    }

    // Work before the failure is kept; later systems did not run.
    assert_eq!(world.get_component::<Position>(good).unwrap(), &Position(2.0));
    assert_eq!(world.get_component::<Position>(bad).unwrap(), &Position(-1.0));
    assert_eq!(*visited.borrow(), 1);
    assert!(trace.borrow().is_empty());

    // The dead entity left its families but is destroyed by a later step.
    assert!(!world.is_alive(doomed));
    assert!(world.inspect(doomed).is_ok());

    world.get_component_mut::<Position>(bad).unwrap().0 = 0.0;
    let report = world.step("fixed", 0.0).unwrap();
    assert_eq!(report.destroyed, 1);
    assert!(world.inspect(doomed).is_err());
    assert_eq!(trace.borrow().len(), 2);
}

#[test]
fn test_failing_command_discards_the_rest() {
    /// Queues an invalid insert followed by a spawn.
    struct Misbehave {
        spawned: Rc<RefCell<Option<EntityId>>>,
    }

    impl System for Misbehave {
        type Query = (Read<Position>,);

        fn update(
            &mut self,
            ctx: &mut StepContext<'_>,
            entity: EntityId,
            _item: QueryItem<'_, Self::Query>,
        ) -> EcsResult<()> {
            if ctx.step() == 1 {
                ctx.insert(entity, Position(9.0)); // duplicate
                let child = ctx.spawn();
                ctx.insert(child, Velocity(1.0));
                *self.spawned.borrow_mut() = Some(child);
            }
            Ok(())
        }
    }

    let mut world = World::new(WorldConfig::default());
    let spawned = Rc::new(RefCell::new(None));
    let entity = spawn_with_position(&mut world, 0.0);
    world
        .add_system("fixed", Misbehave { spawned: Rc::clone(&spawned) })
        .unwrap();

    world.step("fixed", 0.0).unwrap();
    let err = world.step("fixed", 0.0).unwrap_err();
    assert!(matches!(
        err,
        EcsError::StepAborted { phase: "SpawnPending", ref source, .. }
            if matches!(**source, EcsError::DuplicateComponent { .. })
    ));

    let child = spawned.borrow().unwrap();
    assert!(world.inspect(child).is_err());
    assert_eq!(world.get_component::<Position>(entity).unwrap(), &Position(0.0));

    // Queue is empty now; the world keeps working.
    let report = world.step("fixed", 0.0).unwrap();
    assert_eq!(report.commands, 0);
    assert_eq!(world.entity_count(), 1);
}

#[test]
fn test_repeated_destroy_does_not_abort() {
    /// Destroys every member; optionally spawns debris for each.
    struct Collide {
        label: &'static str,
        debris: Rc<RefCell<Vec<EntityId>>>,
        spawn: bool,
    }

    impl System for Collide {
        type Query = (Read<Position>,);

        fn name(&self) -> &str {
            self.label
        }

        fn update(
            &mut self,
            ctx: &mut StepContext<'_>,
            entity: EntityId,
            _item: QueryItem<'_, Self::Query>,
        ) -> EcsResult<()> {
            ctx.destroy(entity);
            if self.spawn {
                let child = ctx.spawn();
                ctx.insert(child, Velocity(1.0));
                self.debris.borrow_mut().push(child);
            }
            Ok(())
        }
    }

    let mut world = World::new(WorldConfig::default());
    let debris = Rc::new(RefCell::new(Vec::new()));
    let entity = spawn_with_position(&mut world, 0.0);
    for (label, spawn) in [("collide_a", false), ("collide_b", true)] {
        let debris = Rc::clone(&debris);
        world
            .add_system("fixed", Collide { label, debris, spawn })
            .unwrap();
    }

    world.step("fixed", 0.0).unwrap();
    let report = world.step("fixed", 0.0).unwrap();
    assert_eq!(report.commands, 4); // destroy, destroy, spawn, insert
    assert_eq!(report.spawned, 1);
    assert_eq!(report.destroyed, 1);
    assert!(!world.is_alive(entity));

    let child = debris.borrow()[0];
    assert!(world.is_alive(child));
    assert_eq!(world.get_component::<Velocity>(child).unwrap(), &Velocity(1.0));
}

#[test]
fn test_query_outside_declared_masks_is_rejected() {
    let mut world = World::new(WorldConfig::default());
    let position = world.register::<Position>().unwrap();
    let velocity = world.register::<Velocity>().unwrap();

    // Integrate writes Position but only reads are declared.
    let reads = ComponentMask::from_ids(&[position, velocity]);
    let err = world
        .add_system_with_access("fixed", Integrate, reads, ComponentMask::new())
        .unwrap_err();
    assert!(matches!(err, EcsError::AccessViolation { component: "Position" }));
    assert_eq!(world.families().count(), 0);

    // Declaring more than the query uses widens the family.
    let lifetime = world.register::<Lifetime>().unwrap();
    let system = world
        .add_system_with_access(
            "fixed",
            Integrate,
            ComponentMask::from_ids(&[velocity, lifetime]),
            ComponentMask::from_ids(&[position]),
        )
        .unwrap();
    let info = world.binding_info(system).unwrap();
    assert_eq!(
        world.family(info.family).unwrap().required(),
        &ComponentMask::from_ids(&[position, velocity, lifetime])
    );
}

// ============================================================================
// MANIFESTS
// ============================================================================

const MANIFEST: &str = r#"
[[system]]
name = "integrate"
timeline = "fixed"
reads = ["Velocity"]
writes = ["Position"]

[[system]]
name = "observe"
timeline = "render"
reads = ["Position"]
"#;

fn factory(trace: &Trace) -> SystemFactory {
    let mut factory = SystemFactory::new();
    let trace = Rc::clone(trace);
    factory
        .register("integrate", Integrate::default)
        .register("observe", move || Observe { label: "observe", trace: Rc::clone(&trace) });
    factory
}

#[test]
fn test_load_systems_from_manifest() {
    let mut world = World::new(WorldConfig::default());
    world.register::<Position>().unwrap();
    world.register::<Velocity>().unwrap();
    let trace: Trace = Rc::default();

    let manifest = SystemManifest::from_toml_str(MANIFEST).unwrap();
    let installed = world.load_systems(&manifest, &mut factory(&trace)).unwrap();
    assert_eq!(installed.len(), 2);

    let integrate = world.binding_info(installed[0]).unwrap();
    assert_eq!(integrate.name, "integrate");
    assert_eq!(integrate.timeline, "fixed");
    assert_eq!(integrate.writes.len(), 1);

    let entity = world.create_entity();
    world.add_component(entity, Position(0.0)).unwrap();
    world.add_component(entity, Velocity(4.0)).unwrap();

    world.step("fixed", 0.5).unwrap();
    assert_eq!(world.get_component::<Position>(entity).unwrap(), &Position(2.0));

    world.step("render", 0.0).unwrap();
    assert_eq!(*trace.borrow(), vec![("observe", entity)]);
}

#[test]
fn test_manifest_errors_install_nothing() {
    let mut world = World::new(WorldConfig::default());
    world.register::<Position>().unwrap();
    let trace: Trace = Rc::default();
    let manifest = SystemManifest::from_toml_str(MANIFEST).unwrap();

    // Velocity is not registered.
    let err = world.load_systems(&manifest, &mut factory(&trace)).unwrap_err();
    assert!(matches!(err, EcsError::UnknownComponentName(ref name) if name == "Velocity"));
    assert!(world.timeline_systems("fixed").unwrap().is_empty());

    world.register::<Velocity>().unwrap();
    let err = world
        .load_systems(&manifest, &mut SystemFactory::new())
        .unwrap_err();
    assert!(matches!(err, EcsError::UnknownSystemName(ref name) if name == "integrate"));

    let physics = SystemManifest::from_toml_str(
        "[[system]]\nname = \"integrate\"\ntimeline = \"physics\"\n",
    )
    .unwrap();
    let err = world.load_systems(&physics, &mut factory(&trace)).unwrap_err();
    assert!(matches!(err, EcsError::UnknownTimeline(_)));
    assert!(world.timeline_systems("render").unwrap().is_empty());
}

#[test]
fn test_manifest_query_mismatch_installs_nothing() {
    let mut world = World::new(WorldConfig::default());
    world.register::<Position>().unwrap();
    world.register::<Velocity>().unwrap();
    let trace: Trace = Rc::default();

    // The first entry is valid; the second declares Position read-only
    // although integrate writes it.
    let manifest = SystemManifest::from_toml_str(
        r#"
        [[system]]
        name = "observe"
        timeline = "render"
        reads = ["Position"]

        [[system]]
        name = "integrate"
        timeline = "fixed"
        reads = ["Position", "Velocity"]
        "#,
    )
    .unwrap();

    let err = world.load_systems(&manifest, &mut factory(&trace)).unwrap_err();
    assert!(matches!(err, EcsError::AccessViolation { component: "Position" }));
    assert!(world.timeline_systems("render").unwrap().is_empty());
    assert!(world.timeline_systems("fixed").unwrap().is_empty());
    assert_eq!(world.families().count(), 0);
}
