use chrono::{FixedOffset, NaiveDate, Weekday};

use super::*;
use crate::limits::*;

// Frozen at Sunday 2026-10-18 10:00 local, open 8:00-23:00.
fn calendar() -> Calendar {
    Calendar::new(FixedOffset::west_opt(6 * 3600).unwrap(), 8, 23)
        .frozen_at(date(2026, 10, 18).and_hms_opt(10, 0, 0).unwrap())
}

fn date(y: i32, m: u32, d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(y, m, d).unwrap()
}

fn test_wal_path(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join("canchas_test_engine");
    std::fs::create_dir_all(&dir).unwrap();
    let path = dir.join(name);
    let _ = std::fs::remove_file(&path);
    path
}

fn engine(name: &str) -> Engine {
    Engine::new(test_wal_path(name), calendar()).unwrap()
}

fn contact(name: &str) -> Contact {
    Contact {
        name: name.into(),
        phone: "8888-0000".into(),
    }
}

async fn cancha(engine: &Engine, local: Local, price: u32) -> Ulid {
    let id = Ulid::new();
    engine
        .create_cancha(id, local, format!("Cancha {id}"), price)
        .await
        .unwrap();
    id
}

fn reserva(cancha_id: Ulid, date: NaiveDate, hour: u32) -> NewReserva {
    NewReserva {
        id: Ulid::new(),
        cancha_id,
        date,
        hour,
        hours: 1,
        contact: contact("Ana"),
        price: None,
    }
}

fn fija(cancha_id: Ulid, weekday: Weekday, hour: u32) -> NewFija {
    NewFija {
        id: Ulid::new(),
        cancha_id,
        weekday,
        hour,
        hours: 1,
        contact: contact("Los Pumas"),
        price: None,
    }
}

/// Hub cancha with two members, all at Sabana.
async fn hub_and_members(engine: &Engine) -> (Ulid, Ulid, Ulid) {
    let hub = cancha(engine, Local::Sabana, 60_000).await;
    let a = cancha(engine, Local::Sabana, 25_000).await;
    let b = cancha(engine, Local::Sabana, 25_000).await;
    engine.link_canchas(Ulid::new(), hub, a).await.unwrap();
    engine.link_canchas(Ulid::new(), hub, b).await.unwrap();
    (hub, a, b)
}

fn dates(reservas: &[ReservaInfo]) -> Vec<NaiveDate> {
    reservas.iter().map(|r| r.date).collect()
}

// ── Canchas ──────────────────────────────────────────────

#[tokio::test]
async fn create_and_list_canchas_by_local() {
    let engine = engine("list_canchas.wal");
    let s = cancha(&engine, Local::Sabana, 30_000).await;
    let g = cancha(&engine, Local::Guadalupe, 20_000).await;

    assert_eq!(engine.list_canchas(None).await.len(), 2);
    let sabana = engine.list_canchas(Some(Local::Sabana)).await;
    assert_eq!(sabana.len(), 1);
    assert_eq!(sabana[0].id, s);
    assert_eq!(engine.list_canchas(Some(Local::Guadalupe)).await[0].id, g);
}

#[tokio::test]
async fn duplicate_cancha_id_rejected() {
    let engine = engine("dup_cancha.wal");
    let id = cancha(&engine, Local::Sabana, 1).await;
    let err = engine
        .create_cancha(id, Local::Sabana, "Otra".into(), 1)
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::AlreadyExists(x) if x == id));
}

#[tokio::test]
async fn update_cancha_keeps_unset_fields() {
    let engine = engine("update_cancha.wal");
    let id = cancha(&engine, Local::Sabana, 30_000).await;
    engine.update_cancha(id, None, Some(35_000)).await.unwrap();

    let info = &engine.list_canchas(None).await[0];
    assert_eq!(info.price, 35_000);
    assert!(info.name.starts_with("Cancha"));
}

#[tokio::test]
async fn cancha_in_use_cannot_be_deleted() {
    let engine = engine("delete_in_use.wal");
    let (hub, a, _) = hub_and_members(&engine).await;
    assert!(matches!(
        engine.delete_cancha(a).await,
        Err(EngineError::InUse(id, _)) if id == a
    ));

    let lone = cancha(&engine, Local::Guadalupe, 1).await;
    let r = reserva(lone, date(2026, 10, 20), 19);
    let rid = r.id;
    engine.confirm_reserva(r).await.unwrap();
    assert!(matches!(engine.delete_cancha(lone).await, Err(EngineError::InUse(..))));

    engine.cancel_reserva(rid).await.unwrap();
    engine.delete_cancha(lone).await.unwrap();
    assert!(engine.get_cancha(&lone).is_none());
    assert!(engine.get_cancha(&hub).is_some());
}

// ── Links ────────────────────────────────────────────────

#[tokio::test]
async fn link_rules() {
    let engine = engine("link_rules.wal");
    let s1 = cancha(&engine, Local::Sabana, 1).await;
    let s2 = cancha(&engine, Local::Sabana, 1).await;
    let g = cancha(&engine, Local::Guadalupe, 1).await;

    assert!(matches!(
        engine.link_canchas(Ulid::new(), s1, s1).await,
        Err(EngineError::InvalidLink(_))
    ));
    assert!(matches!(
        engine.link_canchas(Ulid::new(), s1, g).await,
        Err(EngineError::InvalidLink(_))
    ));
    assert!(matches!(
        engine.link_canchas(Ulid::new(), s1, Ulid::new()).await,
        Err(EngineError::NotFound(_))
    ));

    engine.link_canchas(Ulid::new(), s1, s2).await.unwrap();
    assert!(matches!(
        engine.link_canchas(Ulid::new(), s2, s1).await,
        Err(EngineError::InvalidLink(_))
    ));
    assert_eq!(engine.neighbors(s1), vec![s2]);
    assert_eq!(engine.neighbors(s2), vec![s1]);
}

#[tokio::test]
async fn link_blocked_by_existing_cross_conflict() {
    let engine = engine("link_conflict.wal");
    let hub = cancha(&engine, Local::Sabana, 1).await;
    let member = cancha(&engine, Local::Sabana, 1).await;
    engine.confirm_reserva(reserva(hub, date(2026, 10, 21), 18)).await.unwrap();
    engine.confirm_reserva(reserva(member, date(2026, 10, 21), 18)).await.unwrap();

    let err = engine.link_canchas(Ulid::new(), hub, member).await.unwrap_err();
    assert!(err.is_conflict());
    assert!(engine.list_links().is_empty());
}

#[tokio::test]
async fn unlink_frees_shared_slots() {
    let engine = engine("unlink.wal");
    let hub = cancha(&engine, Local::Sabana, 1).await;
    let member = cancha(&engine, Local::Sabana, 1).await;
    let link_id = Ulid::new();
    engine.link_canchas(link_id, hub, member).await.unwrap();
    engine.confirm_reserva(reserva(hub, date(2026, 10, 21), 18)).await.unwrap();
    assert!(engine
        .confirm_reserva(reserva(member, date(2026, 10, 21), 18))
        .await
        .is_err());

    let link = engine.unlink_canchas(link_id).await.unwrap();
    assert_eq!(link.member_id, member);
    engine
        .confirm_reserva(reserva(member, date(2026, 10, 21), 18))
        .await
        .unwrap();
}

// ── Reservas ─────────────────────────────────────────────

#[tokio::test]
async fn reserva_takes_cancha_price_by_default() {
    let engine = engine("default_price.wal");
    let c = cancha(&engine, Local::Guadalupe, 22_000).await;
    engine.confirm_reserva(reserva(c, date(2026, 10, 19), 20)).await.unwrap();
    let mut custom = reserva(c, date(2026, 10, 19), 21);
    custom.price = Some(15_000);
    engine.confirm_reserva(custom).await.unwrap();

    let day = engine.reservas_for_cancha(c, date(2026, 10, 19)).await;
    assert_eq!(day.iter().map(|r| (r.hour, r.price)).collect::<Vec<_>>(), vec![(20, 22_000), (21, 15_000)]);
}

#[tokio::test]
async fn same_slot_conflicts_adjacent_does_not() {
    let engine = engine("same_slot.wal");
    let c = cancha(&engine, Local::Sabana, 1).await;
    let first = reserva(c, date(2026, 10, 20), 19);
    let first_id = first.id;
    engine.confirm_reserva(first).await.unwrap();

    let err = engine
        .confirm_reserva(reserva(c, date(2026, 10, 20), 19))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Conflict(id) if id == first_id));

    engine.confirm_reserva(reserva(c, date(2026, 10, 20), 18)).await.unwrap();
    engine.confirm_reserva(reserva(c, date(2026, 10, 20), 20)).await.unwrap();

    let mut long = reserva(c, date(2026, 10, 20), 17);
    long.hours = 2;
    assert!(engine.confirm_reserva(long).await.unwrap_err().is_conflict());
}

#[tokio::test]
async fn hub_blocks_members_but_members_dont_block_each_other() {
    let engine = engine("hub_members.wal");
    let (hub, a, b) = hub_and_members(&engine).await;
    let day = date(2026, 10, 22);

    engine.confirm_reserva(reserva(a, day, 19)).await.unwrap();
    assert!(engine.confirm_reserva(reserva(hub, day, 19)).await.unwrap_err().is_conflict());
    engine.confirm_reserva(reserva(b, day, 19)).await.unwrap();

    engine.confirm_reserva(reserva(hub, day, 21)).await.unwrap();
    assert!(engine.confirm_reserva(reserva(a, day, 21)).await.unwrap_err().is_conflict());
    assert!(engine.confirm_reserva(reserva(b, day, 21)).await.unwrap_err().is_conflict());
}

#[tokio::test]
async fn slot_checks() {
    let engine = engine("slot_checks.wal");
    let c = cancha(&engine, Local::Sabana, 1).await;
    let today = date(2026, 10, 18);

    assert!(matches!(
        engine.confirm_reserva(reserva(c, today, 9)).await,
        Err(EngineError::InPast { hour: 9, .. })
    ));
    engine.confirm_reserva(reserva(c, today, 10)).await.unwrap();

    assert!(matches!(
        engine.confirm_reserva(reserva(c, today, 7)).await,
        Err(EngineError::OutsideHours { hour: 7, hours: 1 })
    ));
    let mut late = reserva(c, today, 22);
    late.hours = 2;
    assert!(matches!(engine.confirm_reserva(late).await, Err(EngineError::OutsideHours { .. })));

    let mut too_long = reserva(c, today, 12);
    too_long.hours = MAX_SLOT_HOURS + 1;
    assert!(matches!(engine.confirm_reserva(too_long).await, Err(EngineError::LimitExceeded(_))));

    assert!(matches!(
        engine.confirm_reserva(reserva(c, date(2028, 1, 1), 12)).await,
        Err(EngineError::TooFarAhead(_))
    ));

    let mut nameless = reserva(c, today, 12);
    nameless.contact.name = "  ".into();
    assert!(matches!(engine.confirm_reserva(nameless).await, Err(EngineError::Invalid(_))));

    assert!(matches!(
        engine.confirm_reserva(reserva(Ulid::new(), today, 12)).await,
        Err(EngineError::NotFound(_))
    ));
}

#[tokio::test]
async fn batch_is_all_or_nothing() {
    let engine = engine("batch.wal");
    let c = cancha(&engine, Local::Guadalupe, 1).await;
    let day = date(2026, 10, 23);
    engine.confirm_reserva(reserva(c, day, 20)).await.unwrap();

    let batch = vec![reserva(c, day, 18), reserva(c, day, 20)];
    assert!(engine.batch_confirm_reservas(batch).await.unwrap_err().is_conflict());
    assert_eq!(engine.reservas_for_cancha(c, day).await.len(), 1);

    let clashing = vec![reserva(c, day, 15), reserva(c, day, 15)];
    assert!(engine.batch_confirm_reservas(clashing).await.unwrap_err().is_conflict());
    assert_eq!(engine.reservas_for_cancha(c, day).await.len(), 1);

    let ok = vec![reserva(c, day, 15), reserva(c, day, 16), reserva(c, day, 17)];
    engine.batch_confirm_reservas(ok).await.unwrap();
    assert_eq!(engine.reservas_for_cancha(c, day).await.len(), 4);
}

#[tokio::test]
async fn batch_sees_links_between_its_own_rows() {
    let engine = engine("batch_links.wal");
    let (hub, a, _) = hub_and_members(&engine).await;
    let day = date(2026, 10, 23);
    let batch = vec![reserva(a, day, 20), reserva(hub, day, 20)];
    assert!(engine.batch_confirm_reservas(batch).await.unwrap_err().is_conflict());
    assert!(engine.reservas_for_local(Local::Sabana, day).await.is_empty());
}

#[tokio::test]
async fn update_reserva_moves_and_checks() {
    let engine = engine("update_reserva.wal");
    let c = cancha(&engine, Local::Sabana, 1).await;
    let day = date(2026, 10, 24);
    let r = reserva(c, day, 18);
    let id = r.id;
    engine.confirm_reserva(r).await.unwrap();
    engine.confirm_reserva(reserva(c, day, 20)).await.unwrap();

    let patch = ReservaPatch {
        hour: Some(20),
        ..Default::default()
    };
    assert!(engine.update_reserva(id, patch).await.unwrap_err().is_conflict());

    // Growing into its own slot is fine.
    let patch = ReservaPatch {
        hours: Some(2),
        name: Some("Beto".into()),
        ..Default::default()
    };
    let info = engine.update_reserva(id, patch).await.unwrap();
    assert_eq!((info.hour, info.hours), (18, 2));
    assert_eq!(info.contact.name, "Beto");

    let patch = ReservaPatch {
        date: Some(date(2026, 10, 25)),
        ..Default::default()
    };
    engine.update_reserva(id, patch).await.unwrap();
    assert_eq!(engine.reservas_for_cancha(c, day).await.len(), 1);
    let moved = engine.reservas_for_cancha(c, date(2026, 10, 25)).await;
    assert_eq!(moved[0].id, id);
    assert_eq!(moved[0].hours, 2);
}

#[tokio::test]
async fn cancel_reserva_frees_slot() {
    let engine = engine("cancel.wal");
    let c = cancha(&engine, Local::Sabana, 1).await;
    let r = reserva(c, date(2026, 10, 20), 19);
    let id = r.id;
    engine.confirm_reserva(r).await.unwrap();
    assert_eq!(engine.cancel_reserva(id).await.unwrap(), c);
    assert!(matches!(engine.cancel_reserva(id).await, Err(EngineError::NotFound(_))));
    engine.confirm_reserva(reserva(c, date(2026, 10, 20), 19)).await.unwrap();
}

#[tokio::test]
async fn availability_accounts_for_links_and_clock() {
    let engine = engine("availability.wal");
    let (hub, a, _) = hub_and_members(&engine).await;
    let today = date(2026, 10, 18);
    engine.confirm_reserva(reserva(hub, today, 12)).await.unwrap();

    let hours = engine.availability(a, today, 1).await.unwrap();
    assert_eq!(hours.first(), Some(&10));
    assert!(!hours.contains(&12));
    assert_eq!(hours.last(), Some(&22));

    let two = engine.availability(a, today, 2).await.unwrap();
    assert!(!two.contains(&11));
    assert!(two.contains(&13));
    assert_eq!(two.last(), Some(&21));

    assert!(matches!(
        engine.availability(Ulid::new(), today, 1).await,
        Err(EngineError::NotFound(_))
    ));
}

// ── Reservas fijas ───────────────────────────────────────

#[tokio::test]
async fn fija_books_next_four_weeks() {
    let engine = engine("fija_create.wal");
    let c = cancha(&engine, Local::Guadalupe, 20_000).await;
    let req = fija(c, Weekday::Tue, 20);
    let fija_id = req.id;

    let outcome = engine.create_fija(req).await.unwrap();
    let expected = vec![
        date(2026, 10, 20),
        date(2026, 10, 27),
        date(2026, 11, 3),
        date(2026, 11, 10),
    ];
    assert_eq!(outcome.booked, expected);
    assert!(outcome.conflicts.is_empty());

    let instances = engine.reservas_for_fija(fija_id).await;
    assert_eq!(dates(&instances), expected);
    assert!(instances.iter().all(|r| r.fija_id == Some(fija_id) && r.hour == 20 && r.price == 20_000));
    assert_eq!(engine.get_fija(fija_id).unwrap().price, 20_000);
}

#[tokio::test]
async fn fija_on_todays_weekday_depends_on_clock() {
    let engine = engine("fija_today.wal");
    let c = cancha(&engine, Local::Sabana, 1).await;

    let started = engine.create_fija(fija(c, Weekday::Sun, 9)).await.unwrap();
    assert_eq!(started.booked.first(), Some(&date(2026, 10, 25)));

    let later = engine.create_fija(fija(c, Weekday::Sun, 18)).await.unwrap();
    assert_eq!(later.booked.first(), Some(&date(2026, 10, 18)));
    assert_eq!(later.booked.len(), FIJA_OCCURRENCES);
}

#[tokio::test]
async fn fija_skips_dates_taken_on_linked_canchas() {
    let engine = engine("fija_conflict.wal");
    let (hub, a, _) = hub_and_members(&engine).await;
    engine.confirm_reserva(reserva(a, date(2026, 10, 27), 20)).await.unwrap();

    let preview = engine
        .preview_fija(hub, Weekday::Tue, 20, 1, None)
        .await
        .unwrap();
    assert_eq!(preview.iter().filter(|o| !o.is_free()).count(), 1);
    assert!(engine.list_fijas(None).is_empty());

    let outcome = engine.create_fija(fija(hub, Weekday::Tue, 20)).await.unwrap();
    assert_eq!(outcome.conflicts, vec![date(2026, 10, 27)]);
    assert_eq!(outcome.booked.len(), 3);
    assert!(!outcome.booked.contains(&date(2026, 10, 27)));
}

#[tokio::test]
async fn preview_from_a_later_start() {
    let engine = engine("fija_preview.wal");
    let c = cancha(&engine, Local::Sabana, 1).await;
    let preview = engine
        .preview_fija(c, Weekday::Sat, 9, 2, Some(date(2026, 11, 1)))
        .await
        .unwrap();
    assert_eq!(preview.len(), FIJA_OCCURRENCES);
    assert_eq!(preview[0].date, date(2026, 11, 7));
    assert!(preview.iter().all(Occurrence::is_free));

    assert!(matches!(
        engine.preview_fija(c, Weekday::Sat, 22, 2, None).await,
        Err(EngineError::OutsideHours { .. })
    ));
}

#[tokio::test]
async fn update_fija_rewrites_upcoming_instances() {
    let engine = engine("fija_update.wal");
    let c = cancha(&engine, Local::Sabana, 1).await;
    let req = fija(c, Weekday::Tue, 20);
    let fija_id = req.id;
    engine.create_fija(req).await.unwrap();

    let patch = FijaPatch {
        weekday: Some(Weekday::Thu),
        hour: Some(21),
        price: Some(30_000),
        ..Default::default()
    };
    let updated = engine.update_fija(fija_id, patch).await.unwrap();
    assert_eq!(updated.weekday, Weekday::Thu);

    let instances = engine.reservas_for_fija(fija_id).await;
    assert_eq!(
        dates(&instances),
        vec![
            date(2026, 10, 22),
            date(2026, 10, 29),
            date(2026, 11, 5),
            date(2026, 11, 12),
        ]
    );
    assert!(instances.iter().all(|r| r.hour == 21 && r.price == 30_000));
    assert!(engine.reservas_for_cancha(c, date(2026, 10, 20)).await.is_empty());
}

#[tokio::test]
async fn update_fija_to_earlier_weekday_stays_in_future() {
    let engine = engine("fija_update_past.wal");
    let c = cancha(&engine, Local::Sabana, 1).await;
    let req = fija(c, Weekday::Sun, 18);
    let fija_id = req.id;
    engine.create_fija(req).await.unwrap();

    // Saturday of this week has passed, so every instance slides a week on.
    let patch = FijaPatch {
        weekday: Some(Weekday::Sat),
        ..Default::default()
    };
    engine.update_fija(fija_id, patch).await.unwrap();
    assert_eq!(
        dates(&engine.reservas_for_fija(fija_id).await),
        vec![
            date(2026, 10, 24),
            date(2026, 10, 31),
            date(2026, 11, 7),
            date(2026, 11, 14),
        ]
    );
}

#[tokio::test]
async fn update_fija_conflict_changes_nothing() {
    let engine = engine("fija_update_conflict.wal");
    let c = cancha(&engine, Local::Sabana, 1).await;
    let req = fija(c, Weekday::Tue, 20);
    let fija_id = req.id;
    engine.create_fija(req).await.unwrap();
    engine.confirm_reserva(reserva(c, date(2026, 10, 29), 20)).await.unwrap();

    let patch = FijaPatch {
        weekday: Some(Weekday::Thu),
        ..Default::default()
    };
    assert!(engine.update_fija(fija_id, patch).await.unwrap_err().is_conflict());
    assert_eq!(engine.get_fija(fija_id).unwrap().weekday, Weekday::Tue);
    assert_eq!(
        dates(&engine.reservas_for_fija(fija_id).await)[0],
        date(2026, 10, 20)
    );
}

#[tokio::test]
async fn update_fija_blocked_by_linked_cancha() {
    let engine = engine("fija_update_linked.wal");
    let (hub, a, _) = hub_and_members(&engine).await;
    let req = fija(a, Weekday::Tue, 20);
    let fija_id = req.id;
    engine.create_fija(req).await.unwrap();
    engine.confirm_reserva(reserva(hub, date(2026, 10, 29), 20)).await.unwrap();

    let patch = FijaPatch {
        weekday: Some(Weekday::Thu),
        ..Default::default()
    };
    assert!(engine.update_fija(fija_id, patch).await.unwrap_err().is_conflict());
    assert_eq!(engine.get_fija(fija_id).unwrap().weekday, Weekday::Tue);
    assert_eq!(
        dates(&engine.reservas_for_fija(fija_id).await),
        [date(2026, 10, 20), date(2026, 10, 27), date(2026, 11, 3), date(2026, 11, 10)]
    );
}

#[tokio::test]
async fn update_fija_contact_only_keeps_dates() {
    let engine = engine("fija_update_contact.wal");
    let c = cancha(&engine, Local::Sabana, 1).await;
    let req = fija(c, Weekday::Wed, 19);
    let fija_id = req.id;
    let booked = engine.create_fija(req).await.unwrap().booked;

    let patch = FijaPatch {
        phone: Some("7000-1234".into()),
        ..Default::default()
    };
    engine.update_fija(fija_id, patch).await.unwrap();
    let instances = engine.reservas_for_fija(fija_id).await;
    assert_eq!(dates(&instances), booked);
    assert!(instances.iter().all(|r| r.contact.phone == "7000-1234"));
}

#[tokio::test]
async fn delete_fija_cascades() {
    let engine = engine("fija_delete.wal");
    let c = cancha(&engine, Local::Guadalupe, 1).await;
    let req = fija(c, Weekday::Fri, 19);
    let fija_id = req.id;
    engine.create_fija(req).await.unwrap();
    engine.confirm_reserva(reserva(c, date(2026, 10, 23), 20)).await.unwrap();

    assert_eq!(engine.delete_fija(fija_id).await.unwrap(), FIJA_OCCURRENCES);
    assert!(engine.get_fija(fija_id).is_none());
    assert!(engine.reservas_for_fija(fija_id).await.is_empty());
    assert_eq!(engine.reservas_for_cancha(c, date(2026, 10, 23)).await.len(), 1);
    assert!(matches!(engine.delete_fija(fija_id).await, Err(EngineError::NotFound(_))));
}

#[tokio::test]
async fn renew_fija_fills_missing_dates() {
    let engine = engine("fija_renew.wal");
    let c = cancha(&engine, Local::Sabana, 1).await;
    let req = fija(c, Weekday::Tue, 20);
    let fija_id = req.id;
    engine.create_fija(req).await.unwrap();

    let second = engine.reservas_for_fija(fija_id).await[1].id;
    engine.cancel_reserva(second).await.unwrap();

    let outcome = engine.renew_fija(fija_id).await.unwrap();
    assert_eq!(outcome.booked, vec![date(2026, 10, 27)]);
    assert_eq!(engine.reservas_for_fija(fija_id).await.len(), FIJA_OCCURRENCES);

    let again = engine.renew_fija(fija_id).await.unwrap();
    assert!(again.booked.is_empty() && again.conflicts.is_empty());
}

#[tokio::test]
async fn renew_fija_skips_taken_dates() {
    let engine = engine("fija_renew_conflict.wal");
    let (hub, a, _) = hub_and_members(&engine).await;
    let req = fija(a, Weekday::Tue, 20);
    let fija_id = req.id;
    engine.create_fija(req).await.unwrap();

    let second = engine.reservas_for_fija(fija_id).await[1].id;
    engine.cancel_reserva(second).await.unwrap();
    engine.confirm_reserva(reserva(hub, date(2026, 10, 27), 20)).await.unwrap();

    let outcome = engine.renew_fija(fija_id).await.unwrap();
    assert!(outcome.booked.is_empty());
    assert_eq!(outcome.conflicts, vec![date(2026, 10, 27)]);
    assert_eq!(engine.reservas_for_fija(fija_id).await.len(), FIJA_OCCURRENCES - 1);
}

#[tokio::test]
async fn fija_blocks_cancha_deletion() {
    let engine = engine("fija_in_use.wal");
    let c = cancha(&engine, Local::Sabana, 1).await;
    let req = fija(c, Weekday::Mon, 8);
    let fija_id = req.id;
    engine.create_fija(req).await.unwrap();
    assert!(matches!(engine.delete_cancha(c).await, Err(EngineError::InUse(..))));
    assert_eq!(engine.list_fijas(Some(c)).len(), 1);
    engine.delete_fija(fija_id).await.unwrap();
    engine.delete_cancha(c).await.unwrap();
}

// ── Concurrent writers ───────────────────────────────────

#[tokio::test]
async fn link_and_booking_race_never_double_books() {
    let engine = engine("race_link_booking.wal");
    let hub = cancha(&engine, Local::Sabana, 60_000).await;
    let member = cancha(&engine, Local::Sabana, 25_000).await;
    let day = date(2026, 10, 20);
    engine.confirm_reserva(reserva(hub, day, 19)).await.unwrap();

    let (linked, booked) = tokio::join!(
        engine.link_canchas(Ulid::new(), hub, member),
        engine.confirm_reserva(reserva(member, day, 19)),
    );
    assert!(linked.is_ok() != booked.is_ok(), "link={linked:?} booking={booked:?}");

    let member_booked = !engine.reservas_for_cancha(member, day).await.is_empty();
    let still_linked = engine.neighbors(hub).contains(&member);
    assert!(!(member_booked && still_linked));
}

#[tokio::test]
async fn update_racing_delete_does_not_revive_fija() {
    let engine = engine("race_fija_delete_update.wal");
    let c = cancha(&engine, Local::Sabana, 20_000).await;
    let req = fija(c, Weekday::Tue, 20);
    let fija_id = req.id;
    engine.create_fija(req).await.unwrap();

    let patch = FijaPatch {
        price: Some(30_000),
        ..Default::default()
    };
    let (deleted, updated) = tokio::join!(engine.delete_fija(fija_id), engine.update_fija(fija_id, patch));
    assert_eq!(deleted.unwrap(), FIJA_OCCURRENCES);
    if let Err(e) = updated {
        assert!(matches!(e, EngineError::NotFound(id) if id == fija_id));
    }
    assert!(engine.get_fija(fija_id).is_none());
    assert!(engine.reservas_for_fija(fija_id).await.is_empty());
}

#[tokio::test]
async fn renew_racing_delete_leaves_no_orphans() {
    let engine = engine("race_fija_delete_renew.wal");
    let c = cancha(&engine, Local::Guadalupe, 20_000).await;
    let req = fija(c, Weekday::Tue, 20);
    let fija_id = req.id;
    engine.create_fija(req).await.unwrap();
    let first = engine.reservas_for_fija(fija_id).await[0].id;
    engine.cancel_reserva(first).await.unwrap();

    let (deleted, _) = tokio::join!(engine.delete_fija(fija_id), engine.renew_fija(fija_id));
    deleted.unwrap();
    assert!(engine.get_fija(fija_id).is_none());
    for week in 0..FIJA_OCCURRENCES as i64 {
        let day = crate::calendar::add_days(date(2026, 10, 20), 7 * week);
        assert!(engine.reservas_for_cancha(c, day).await.is_empty(), "orphan on {day}");
    }
}

#[tokio::test]
async fn concurrent_fija_updates_both_apply() {
    let engine = engine("race_fija_updates.wal");
    let c = cancha(&engine, Local::Sabana, 20_000).await;
    let req = fija(c, Weekday::Wed, 19);
    let fija_id = req.id;
    engine.create_fija(req).await.unwrap();

    let price = FijaPatch {
        price: Some(30_000),
        ..Default::default()
    };
    let name = FijaPatch {
        name: Some("Tigres".into()),
        ..Default::default()
    };
    let (a, b) = tokio::join!(engine.update_fija(fija_id, price), engine.update_fija(fija_id, name));
    a.unwrap();
    b.unwrap();

    let stored = engine.get_fija(fija_id).unwrap();
    assert_eq!(stored.price, 30_000);
    assert_eq!(stored.contact.name, "Tigres");
    let instances = engine.reservas_for_fija(fija_id).await;
    assert!(instances.iter().all(|r| r.price == 30_000 && r.contact.name == "Tigres"));
}

// ── Persistence ──────────────────────────────────────────

#[tokio::test]
async fn state_survives_restart() {
    let path = test_wal_path("restart.wal");
    let (hub, a, fija_id, moved_id) = {
        let engine = Engine::new(path.clone(), calendar()).unwrap();
        let (hub, a, _) = hub_and_members(&engine).await;
        let req = fija(hub, Weekday::Tue, 20);
        let fija_id = req.id;
        engine.create_fija(req).await.unwrap();
        let r = reserva(a, date(2026, 10, 21), 18);
        let moved_id = r.id;
        engine.confirm_reserva(r).await.unwrap();
        let patch = ReservaPatch {
            hour: Some(19),
            ..Default::default()
        };
        engine.update_reserva(moved_id, patch).await.unwrap();
        (hub, a, fija_id, moved_id)
    };

    let engine = Engine::new(path, calendar()).unwrap();
    assert_eq!(engine.list_canchas(None).await.len(), 3);
    assert_eq!(engine.list_links().len(), 2);
    assert_eq!(engine.reservas_for_fija(fija_id).await.len(), FIJA_OCCURRENCES);
    assert_eq!(engine.get_cancha_for_reserva(&moved_id), Some(a));
    let day = engine.reservas_for_cancha(a, date(2026, 10, 21)).await;
    assert_eq!(day[0].hour, 19);
    assert!(engine
        .confirm_reserva(reserva(hub, date(2026, 10, 21), 19))
        .await
        .unwrap_err()
        .is_conflict());
}

#[tokio::test]
async fn compaction_keeps_state_and_resets_counter() {
    let path = test_wal_path("compaction.wal");
    let c = {
        let engine = Engine::new(path.clone(), calendar()).unwrap();
        let c = cancha(&engine, Local::Guadalupe, 1).await;
        for hour in 10..20 {
            let r = reserva(c, date(2026, 10, 19), hour);
            let id = r.id;
            engine.confirm_reserva(r).await.unwrap();
            engine.cancel_reserva(id).await.unwrap();
        }
        engine.confirm_reserva(reserva(c, date(2026, 10, 19), 21)).await.unwrap();
        engine.create_fija(fija(c, Weekday::Thu, 18)).await.unwrap();
        let before = std::fs::metadata(&path).unwrap().len();

        assert!(!engine.compact_if_needed(1000).await.unwrap());
        assert!(engine.compact_if_needed(10).await.unwrap());
        assert_eq!(engine.wal_appends_since_compact().await, 0);
        assert!(std::fs::metadata(&path).unwrap().len() < before);
        c
    };

    let engine = Engine::new(path, calendar()).unwrap();
    assert_eq!(engine.reservas_for_cancha(c, date(2026, 10, 19)).await.len(), 1);
    assert_eq!(engine.list_fijas(Some(c)).len(), 1);
    assert_eq!(engine.reservas_for_cancha(c, date(2026, 10, 22)).await.len(), 1);
}

#[tokio::test]
async fn cancha_created_during_compaction_survives_restart() {
    let path = test_wal_path("race_compaction.wal");
    let id = Ulid::new();
    {
        let engine = Engine::new(path.clone(), calendar()).unwrap();
        let other = cancha(&engine, Local::Sabana, 1).await;
        engine.confirm_reserva(reserva(other, date(2026, 10, 19), 9)).await.unwrap();

        let (created, compacted) = tokio::join!(
            engine.create_cancha(id, Local::Guadalupe, "Nueva".into(), 15_000),
            engine.compact_wal(),
        );
        created.unwrap();
        compacted.unwrap();
        engine.confirm_reserva(reserva(id, date(2026, 10, 19), 20)).await.unwrap();
    }

    let engine = Engine::new(path, calendar()).unwrap();
    assert!(engine.get_cancha(&id).is_some());
    assert_eq!(engine.reservas_for_cancha(id, date(2026, 10, 19)).await.len(), 1);
    assert_eq!(engine.list_canchas(None).await.len(), 2);
}
