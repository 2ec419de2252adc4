mod common;

use townward::claims::roles::LEVEL_TRUSTED;
use townward::claims::{
    ActionKind, BlockPos, CellCoord, Location, PermissionResolver, Reason, ResidenceFlag,
    SpawnReason, TownFlag,
};
use townward::metrics;

#[test]
fn wildness_allow_list_flips_place() {
    let (_tmp, store) = common::open_store();
    let mut config = common::bare_config();
    let walker = store.resolve_subject("walker").expect("subject");
    let spot = Location::new("w", 100, 64, 100);

    let resolver = PermissionResolver::new(&store, &config);
    assert!(!resolver.can_place(walker, &spot, "oak_sapling"));

    config.rules.wild_place.insert("oak_sapling".to_string());
    let resolver = PermissionResolver::new(&store, &config);
    assert!(resolver.can_place(walker, &spot, "oak_sapling"));
    assert!(!resolver.can_destroy(walker, &spot, "oak_sapling"));
}

#[test]
fn public_flag_opens_interaction() {
    let (_tmp, store) = common::open_store();
    let config = common::bare_config();
    let a = store.resolve_subject("owner_a").expect("a");
    let b = store.resolve_subject("visitor_b").expect("b");
    let house = store
        .create_residence("Cottage", None, Some(a), "w", BlockPos::new(0, 60, 0), BlockPos::new(8, 70, 8))
        .expect("house");
    let door = Location::new("w", 8, 60, 0);
    let resolver = PermissionResolver::new(&store, &config);

    assert!(resolver.can_interact(a, &door));
    assert!(!resolver.can_interact(b, &door));
    store
        .residence_flags()
        .set(house.id, ResidenceFlag::Public)
        .expect("public");
    assert!(resolver.can_interact(b, &door));
}

#[test]
fn destroy_list_or_build_flag_opens_a_town_cell() {
    let (_tmp, store) = common::open_store();
    let mut config = common::bare_config();
    let mayor = store.resolve_subject("mayor").expect("mayor");
    let p = store.resolve_subject("citizen_p").expect("p");
    let town = store
        .create_town("Twn", mayor, "w", CellCoord::new(2, 3))
        .expect("town");
    store.join_town(p, town.id).expect("join");
    assert!(store.is_inhabitant(town.id, p).expect("inhabitant"));
    assert!(!store.is_leader(town.id, p).expect("leader"));

    // A block inside cell (2, 3) with 16-block cells.
    let spot = Location::new("w", 40, 64, 50);
    let resolver = PermissionResolver::new(&store, &config);
    assert!(!resolver.can_destroy(p, &spot, "gravel"));
    assert!(resolver.can_destroy(mayor, &spot, "gravel"));

    config.rules.town_destroy.insert("gravel".to_string());
    let resolver = PermissionResolver::new(&store, &config);
    assert!(resolver.can_destroy(p, &spot, "gravel"));
    assert!(!resolver.can_destroy(p, &spot, "stone"));

    store
        .town_flags()
        .set(town.id, TownFlag::CanBuildByInhabitants)
        .expect("flag");
    assert!(resolver.can_destroy(p, &spot, "stone"));
    let passerby = store.resolve_subject("passerby").expect("passerby");
    assert!(!store.is_inhabitant(town.id, passerby).expect("inhabitant"));
    assert!(resolver.can_destroy(passerby, &spot, "stone"));
    assert!(resolver.can_place(passerby, &spot, "stone"));
}

#[test]
fn every_residence_in_reach_must_agree() {
    let (_tmp, store) = common::open_store();
    let mut config = common::bare_config();
    config.rules.overlay_distance = 2;
    config.rules.wild_place.insert("torch".to_string());
    let a = store.resolve_subject("owner_a").expect("a");
    let b = store.resolve_subject("owner_b").expect("b");
    let left = store
        .create_residence("Left", None, Some(a), "w", BlockPos::new(0, 0, 0), BlockPos::new(4, 4, 4))
        .expect("left");
    let right = store
        .create_residence("Right", None, Some(b), "w", BlockPos::new(7, 0, 0), BlockPos::new(10, 4, 4))
        .expect("right");
    // Gap block: 1 from Right, 2 from Left.
    let gap = Location::new("w", 6, 2, 2);
    let resolver = PermissionResolver::new(&store, &config);

    let decision = resolver.decide_edit(ActionKind::Place, a, &gap, "torch");
    assert!(!decision.allowed);
    assert_eq!(decision.reason, Reason::ResidenceRefused { residence: right.id });
    assert!(!resolver.can_destroy(b, &gap, "torch"));

    store.add_member(right.id, a).expect("member");
    let decision = resolver.decide_edit(ActionKind::Place, a, &gap, "torch");
    assert!(decision.allowed);
    assert!(matches!(
        decision.reason,
        Reason::ResidenceAccepted { residence } if residence == left.id || residence == right.id
    ));
}

#[test]
fn trusted_subjects_override_but_not_for_spawns() {
    let (_tmp, store) = common::open_store();
    let config = common::bare_config();
    let owner = store.resolve_subject("owner").expect("owner");
    let warden = store.resolve_subject("warden").expect("warden");
    store.set_level(warden, LEVEL_TRUSTED).expect("level");
    store
        .create_residence("Keep", None, Some(owner), "w", BlockPos::new(0, 0, 0), BlockPos::new(9, 9, 9))
        .expect("keep");
    let inside = Location::new("w", 5, 5, 5);
    let resolver = PermissionResolver::new(&store, &config);

    assert!(resolver.can_place(warden, &inside, "tnt"));
    assert!(resolver.can_interact(warden, &inside));
    assert!(!resolver.can_spawn(Some(warden), &inside, SpawnReason::Egg));
}

#[test]
fn decisions_are_counted() {
    let (_tmp, store) = common::open_store();
    let config = common::bare_config();
    let walker = store.resolve_subject("walker").expect("subject");
    let before = metrics::snapshot().counter(ActionKind::Destroy);
    let resolver = PermissionResolver::new(&store, &config);
    resolver.can_destroy(walker, &Location::new("w", 0, 0, 0), "stone");
    let after = metrics::snapshot().counter(ActionKind::Destroy);
    assert!(after.denied > before.denied);
}
