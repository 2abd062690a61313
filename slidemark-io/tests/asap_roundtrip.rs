use std::fs;

use glam::DVec2;

use slidemark_core::annotation::{Annotation, AnnotationSet, AnnotationType, GroupId};
use slidemark_core::color::Rgb8;
use slidemark_core::geometry::{Point2, Vector2};
use slidemark_io::{AnnotationSaver, AsapXml, load_into};

const SINGLE_DOT: &str = r##"<ASAP_Annotations><AnnotationGroups></AnnotationGroups><Annotations><Annotation Color="#ff0000" Name="A1" PartOfGroup="None" Type="Dot"><Coordinates><Coordinate Order="0" X="10" Y="20"/></Coordinates></Annotation></Annotations></ASAP_Annotations>"##;

#[test]
fn single_dot_is_scaled_by_mpp() {
    let mpp = Vector2::new(0.25, 0.5);
    let store = AsapXml::new().parse_str(SINGLE_DOT, mpp).expect("解析失败");
    assert_eq!(store.annotation_count(), 1);
    assert_eq!(store.group_count(), 1);
    assert_eq!(store.group(0).unwrap().name, "None");

    let annotation = store.annotation(0).unwrap();
    assert_eq!(annotation.annotation_type, AnnotationType::Point);
    assert_eq!(annotation.name, "A1");
    assert_eq!(annotation.group_id, GroupId::NONE);
    assert_eq!(annotation.coordinates(), &[Point2::new(2.5, 10.0)]);
}

#[test]
fn truncated_file_keeps_previous_annotations() {
    let dir = tempfile::tempdir().unwrap();
    let good = dir.path().join("good.xml");
    let bad = dir.path().join("bad.xml");
    fs::write(&good, SINGLE_DOT).unwrap();
    fs::write(&bad, &SINGLE_DOT[..SINGLE_DOT.len() / 2]).unwrap();

    let mut set = AnnotationSet::new(Vector2::new(1.0, 1.0));
    load_into(&mut set, &good, &AsapXml::new()).unwrap();
    assert!(set.is_loaded_from_disk());
    assert!(!set.is_modified());

    assert!(load_into(&mut set, &bad, &AsapXml::new()).is_err());
    assert_eq!(set.store().annotation_count(), 1);
    assert_eq!(set.source_path(), Some(good.as_path()));
}

#[test]
fn save_then_load_preserves_groups_and_coordinates() {
    let mpp = Vector2::new(0.2427, 0.2431);
    let mut set = AnnotationSet::new(mpp);
    let store = set.store_mut();
    let tumor = store.add_group_with_color("Tumor", Rgb8::new(200, 10, 10));
    let tumor = store.group_id(tumor).unwrap();
    let stroma = store.add_group_with_color("Stroma & fat", Rgb8::new(10, 200, 10));
    let stroma = store.group_id(stroma).unwrap();

    let ring: Vec<Point2> = (0..7)
        .map(|i| {
            let angle = i as f64 * 0.9;
            Point2::from_vec(DVec2::new(1234.567, 890.123) + DVec2::new(angle.cos(), angle.sin()) * 77.7)
        })
        .collect();
    store.push_annotation(Annotation::new(AnnotationType::Polygon, ring, tumor).with_name("region"));
    store.push_annotation(Annotation::new(
        AnnotationType::Rectangle,
        vec![
            Point2::new(0.1, 0.2),
            Point2::new(10.3, 0.2),
            Point2::new(10.3, 5.7),
            Point2::new(0.1, 5.7),
        ],
        stroma,
    ));
    store.push_annotation(Annotation::new(
        AnnotationType::Line,
        vec![Point2::new(-3.0, 4.0), Point2::new(9.0, 9.5)],
        GroupId::NONE,
    ));
    store.push_annotation(Annotation::new(
        AnnotationType::Point,
        vec![Point2::new(42.0, 24.0)],
        tumor,
    ));

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("roundtrip.xml");
    AsapXml::new().save(set.store(), &path).expect("保存失败");

    let mut reloaded = AnnotationSet::new(mpp);
    load_into(&mut reloaded, &path, &AsapXml::new()).expect("重新加载失败");
    let original = set.store();
    let loaded = reloaded.store();

    assert_eq!(loaded.annotation_count(), original.annotation_count());
    let groups = |store: &slidemark_core::annotation::AnnotationStore| {
        store
            .groups()
            .filter(|(id, _)| *id != GroupId::NONE)
            .map(|(_, group)| (group.name.clone(), group.color))
            .collect::<Vec<_>>()
    };
    assert_eq!(groups(loaded), groups(original));

    for ((_, before), (_, after)) in original.annotations().zip(loaded.annotations()) {
        assert_eq!(before.annotation_type, after.annotation_type);
        assert_eq!(before.coordinate_count(), after.coordinate_count());
        let before_group = original.group_by_id(before.group_id).map(|g| g.name.clone());
        let after_group = loaded.group_by_id(after.group_id).map(|g| g.name.clone());
        assert_eq!(before_group, after_group);
        for (a, b) in before.coordinates().iter().zip(after.coordinates()) {
            assert!(a.distance(*b) < 1e-4, "坐标偏差过大: {a:?} vs {b:?}");
        }
    }
}
