//! Splits a batched model output back into per-image records.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{bail, Result};
use ndarray::{concatenate, Axis};

use crate::inference::DetectionBatch;
use crate::record::{HalfArray, ResultRecord, SubjectResult};

/// Rows of every distinct group index value, ascending by value, rows in batch
/// order.
pub fn group_rows(group_index: &[i64]) -> Vec<(i64, Vec<usize>)> {
    let mut groups: BTreeMap<i64, Vec<usize>> = BTreeMap::new();
    for (row, &value) in group_index.iter().enumerate() {
        groups.entry(value).or_default().push(row);
    }
    groups.into_iter().collect()
}

/// Source path of every detection row, looked up by batch slot.
pub fn row_paths(group_index: &[i64], slot_paths: &[PathBuf]) -> Result<Vec<PathBuf>> {
    group_index
        .iter()
        .map(|&slot| match usize::try_from(slot).ok().and_then(|s| slot_paths.get(s)) {
            Some(path) => Ok(path.clone()),
            None => bail!("group index {} outside batch of {}", slot, slot_paths.len()),
        })
        .collect()
}

/// One record per distinct group index value.
///
/// `paths` holds the source path of every detection row; a record takes the
/// path of its first row. `img_path` inside each subject is relative to
/// `image_root` (or the full path when it lies outside it).
pub fn demultiplex(
    detections: &DetectionBatch,
    paths: &[PathBuf],
    image_root: &Path,
) -> Result<Vec<ResultRecord>> {
    detections.validate()?;
    if paths.len() < detections.len() {
        bail!("{} paths for {} detections", paths.len(), detections.len());
    }
    if detections.is_empty() {
        return Ok(Vec::new());
    }

    let pose = concatenate(
        Axis(1),
        &[detections.global_orient.view(), detections.body_pose.view()],
    )?;

    let records = group_rows(&detections.group_index)
        .into_iter()
        .map(|(_, rows)| {
            let img_path = paths[rows[0]].clone();
            let relative = img_path
                .strip_prefix(image_root)
                .map(Path::to_path_buf)
                .unwrap_or_else(|_| img_path.clone());

            let subjects = rows
                .iter()
                .map(|&row| SubjectResult {
                    cam: HalfArray::from_view(detections.cam.row(row)),
                    pose: HalfArray::from_view(pose.row(row)),
                    betas: HalfArray::from_view(detections.betas.row(row)),
                    j3d_smpl24: HalfArray::from_view(detections.j3d_smpl24.index_axis(Axis(0), row)),
                    j3d_spin24: HalfArray::from_view(detections.j3d_spin24.index_axis(Axis(0), row)),
                    j3d_op25: HalfArray::from_view(detections.j3d_op25.index_axis(Axis(0), row)),
                    verts: HalfArray::from_view(detections.vertices(row)),
                    img_path: relative.clone(),
                })
                .collect();

            ResultRecord { img_path, subjects }
        })
        .collect();

    Ok(records)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inference::stub::detection_batch;

    fn paths_for(group_index: &[i64], names: &[&str]) -> Vec<PathBuf> {
        let slots: Vec<PathBuf> = names.iter().map(|n| PathBuf::from("/img").join(n)).collect();
        row_paths(group_index, &slots).unwrap()
    }

    fn first_cam(subject: &SubjectResult) -> f32 {
        subject.cam.to_f32_vec()[0]
    }

    #[test]
    fn test_group_rows_sorted_and_ordered() {
        let groups = group_rows(&[3, 1, 3, 0, 1, 3]);
        assert_eq!(
            groups,
            vec![(0, vec![3]), (1, vec![1, 4]), (3, vec![0, 2, 5])]
        );
    }

    #[test]
    fn test_single_image_two_subjects() {
        let batch = detection_batch(&[0, 0], 4);
        let paths = paths_for(&batch.group_index, &["a.jpg"]);
        let records = demultiplex(&batch, &paths, Path::new("/img")).unwrap();

        assert_eq!(records.len(), 1);
        assert_eq!(records[0].img_path, PathBuf::from("/img/a.jpg"));
        assert_eq!(records[0].subjects.len(), 2);
        assert_eq!(first_cam(&records[0].subjects[0]), 0.0);
        assert_eq!(first_cam(&records[0].subjects[1]), 1.0);
        assert_eq!(records[0].subjects[1].img_path, PathBuf::from("a.jpg"));
    }

    #[test]
    fn test_image_without_detections_produces_no_record() {
        // 3 images, slot 1 has no detections
        let batch = detection_batch(&[0, 2, 2], 4);
        let paths = paths_for(&batch.group_index, &["a.jpg", "b.jpg", "c.jpg"]);
        let records = demultiplex(&batch, &paths, Path::new("/img")).unwrap();

        assert_eq!(records.len(), 2);
        assert_eq!(records[0].img_path, PathBuf::from("/img/a.jpg"));
        assert_eq!(records[1].img_path, PathBuf::from("/img/c.jpg"));
        assert_eq!(records[1].subjects.len(), 2);
    }

    #[test]
    fn test_counts_and_relative_order_unsorted_index() {
        let group_index = [2, 0, 2, 5, 0, 2];
        let batch = detection_batch(&group_index, 4);
        let names = ["a.jpg", "b.jpg", "c.jpg", "d.jpg", "e.jpg", "f.jpg"];
        let paths = paths_for(&group_index, &names);
        let records = demultiplex(&batch, &paths, Path::new("/img")).unwrap();

        assert_eq!(records.len(), 3);
        let total: usize = records.iter().map(|r| r.subjects.len()).sum();
        assert_eq!(total, group_index.len());

        // 各レコード内は元の行順
        let rows: Vec<Vec<f32>> = records
            .iter()
            .map(|r| r.subjects.iter().map(first_cam).collect())
            .collect();
        assert_eq!(rows, vec![vec![1.0, 4.0], vec![0.0, 2.0, 5.0], vec![3.0]]);
        assert_eq!(records[1].img_path, PathBuf::from("/img/c.jpg"));
        assert_eq!(records[2].img_path, PathBuf::from("/img/f.jpg"));
    }

    #[test]
    fn test_output_is_deterministic() {
        let batch = detection_batch(&[1, 0, 1], 4);
        let paths = paths_for(&batch.group_index, &["a.jpg", "b.jpg"]);
        let a = demultiplex(&batch, &paths, Path::new("/img")).unwrap();
        let b = demultiplex(&batch, &paths, Path::new("/img")).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_subject_fields() {
        let batch = detection_batch(&[0, 0], 4);
        let paths = paths_for(&batch.group_index, &["a.jpg"]);
        let records = demultiplex(&batch, &paths, Path::new("/img")).unwrap();
        let subject = &records[0].subjects[1];

        assert_eq!(subject.cam.shape, vec![3]);
        assert_eq!(subject.pose.shape, vec![72]);
        assert_eq!(subject.betas.shape, vec![10]);
        assert_eq!(subject.j3d_smpl24.shape, vec![24, 3]);
        assert_eq!(subject.j3d_spin24.shape, vec![24, 3]);
        assert_eq!(subject.j3d_op25.shape, vec![25, 3]);
        assert_eq!(subject.verts.shape, vec![4, 3]);

        // global orient が先頭
        let pose = subject.pose.to_f32_vec();
        assert_eq!(&pose[..3], &[1.5, 1.5, 1.5]);
        assert_eq!(pose[3], 1.0);
        let verts = subject.verts.points().unwrap();
        assert_eq!(verts[2], [1.5, 1.5, 1.5]);
    }

    #[test]
    fn test_empty_batch_is_not_an_error() {
        let batch = detection_batch(&[], 4);
        let records = demultiplex(&batch, &[], Path::new("/img")).unwrap();
        assert!(records.is_empty());
    }

    #[test]
    fn test_path_outside_root_kept_whole() {
        let batch = detection_batch(&[0], 4);
        let paths = vec![PathBuf::from("/elsewhere/x.png")];
        let records = demultiplex(&batch, &paths, Path::new("/img")).unwrap();
        assert_eq!(records[0].subjects[0].img_path, PathBuf::from("/elsewhere/x.png"));
    }

    #[test]
    fn test_contract_violations() {
        let batch = detection_batch(&[0, 1], 4);
        assert!(demultiplex(&batch, &[PathBuf::from("/img/a.jpg")], Path::new("/img")).is_err());
        assert!(row_paths(&[0, 3], &[PathBuf::from("a"), PathBuf::from("b")]).is_err());
        assert!(row_paths(&[-1], &[PathBuf::from("a")]).is_err());
    }
}
