mod common;

use std::io::Write;
use std::sync::atomic::{AtomicUsize, Ordering};

use tempfile::NamedTempFile;

use common::*;
use h5chunk::{ArrayData, DType, Error, Hdf5Reader, ReaderConfig, SectionPartial, TypedArray};

fn f64s(array: &TypedArray) -> Vec<f64> {
    match &array.data {
        ArrayData::Float64(v) => v.clone(),
        other => panic!("expected f64 data, got {:?}", other),
    }
}

/// Row-major values of a strided selection given as inclusive `(first, last, stride)`.
fn expected(shape: &[u64], ranges: &[(u64, u64, u64)]) -> Vec<f64> {
    let axes: Vec<Vec<u64>> = ranges
        .iter()
        .map(|&(first, last, stride)| (first..=last).step_by(stride as usize).collect())
        .collect();
    let counts: Vec<u64> = axes.iter().map(|a| a.len() as u64).collect();
    let total: u64 = counts.iter().product();
    let mut pos = vec![0u64; axes.len()];
    let mut out = Vec::with_capacity(total as usize);
    for _ in 0..total {
        let index: Vec<u64> = pos.iter().zip(&axes).map(|(&p, a)| a[p as usize]).collect();
        out.push(linear_value(&index, shape));
        odometer(&mut pos, &counts);
    }
    out
}

/// Whole-variable values with the elements of skipped chunks set to `fill`.
fn expected_sparse(shape: &[u64], chunk: &[u64], skip: &dyn Fn(&[u64]) -> bool, fill: f64) -> Vec<f64> {
    let total: u64 = shape.iter().product();
    let mut idx = vec![0u64; shape.len()];
    let mut out = Vec::with_capacity(total as usize);
    for _ in 0..total {
        let corner: Vec<u64> = idx.iter().zip(chunk).map(|(i, c)| i / c * c).collect();
        out.push(if skip(corner.as_slice()) { fill } else { linear_value(&idx, shape) });
        odometer(&mut idx, shape);
    }
    out
}

fn no_skip(_: &[u64]) -> bool {
    false
}

fn single_dataset_file(build: impl FnOnce(&mut H5Builder) -> u64) -> Hdf5Reader {
    init_logger();
    let mut b = H5Builder::new();
    let dataset = build(&mut b);
    let root = b.group(&[("data", Member::Dataset(dataset))]);
    Hdf5Reader::from_bytes(b.finish(root)).unwrap()
}

fn partial(s: &str) -> SectionPartial {
    s.parse().unwrap()
}

// ---- Contiguous and compact ----

#[test]
fn read_contiguous_whole_and_section() {
    let values: Vec<f64> = (0..24).map(|v| v as f64).collect();
    let reader = single_dataset_file(|b| b.contiguous_f64(&[4, 6], &values));
    let var = reader.variable("/data").unwrap();
    assert_eq!(var.shape, vec![4, 6]);
    assert_eq!(var.element.dtype, DType::Float64);
    assert_eq!(var.layout.name(), "contiguous");

    let all = reader.read(&var, None).unwrap();
    assert_eq!(all.shape, vec![4, 6]);
    assert_eq!(f64s(&all), values);

    let part = reader.read(&var, Some(&partial("1:2, 3:5"))).unwrap();
    assert_eq!(part.shape, vec![2, 3]);
    assert_eq!(f64s(&part), expected(&[4, 6], &[(1, 2, 1), (3, 5, 1)]));
}

#[test]
fn read_unallocated_contiguous_is_fill() {
    let reader = single_dataset_file(|b| {
        b.dataset(
            dataspace(&[5], None),
            datatype_int(4, true),
            layout_contiguous(UNDEF, 20),
            None,
            Some(fill_value(&(-9i32).to_le_bytes())),
        )
    });
    let var = reader.variable("data").unwrap();
    let array = reader.read(&var, None).unwrap();
    assert_eq!(array.data, ArrayData::Int32(vec![-9; 5]));
}

#[test]
fn compound_records_read_as_opaque_bytes() {
    let records: Vec<Vec<u8>> = (0..3i32)
        .map(|i| {
            let mut r = i.to_le_bytes().to_vec();
            r.extend_from_slice(&(i as f64 * 0.5).to_le_bytes());
            r
        })
        .collect();
    let reader = single_dataset_file(|b| {
        let data = records.concat();
        let address = b.alloc(&data);
        b.dataset(
            dataspace(&[3], None),
            datatype_compound(&[("n", 0, datatype_int(4, true)), ("v", 4, datatype_float(8))], 12),
            layout_contiguous(address, data.len() as u64),
            None,
            None,
        )
    });
    let var = reader.variable("/data").unwrap();
    assert_eq!(var.element.dtype, DType::Opaque(12));

    let all = reader.read(&var, None).unwrap();
    assert_eq!(all.data, ArrayData::Opaque(records.clone()));
    assert_eq!(all.sum_f64(), 0.0);
    let tail = reader.read(&var, Some(&partial("1:2"))).unwrap();
    assert_eq!(tail.data, ArrayData::Opaque(records[1..].to_vec()));
}

#[test]
fn read_compact() {
    let reader = single_dataset_file(|b| {
        b.dataset(
            dataspace(&[2, 3], None),
            datatype_int(4, true),
            layout_compact(&i32_bytes(&[1, 2, 3, 4, 5, 6])),
            None,
            None,
        )
    });
    let var = reader.variable("/data").unwrap();
    let column = reader.read(&var, Some(&partial(":, 1"))).unwrap();
    assert_eq!(column.shape, vec![2, 1]);
    assert_eq!(column.data, ArrayData::Int32(vec![2, 5]));
}

// ---- Chunked ----

#[test]
fn read_chunked_with_partial_edge_chunks() {
    let shape = [10u64, 13];
    let reader = single_dataset_file(|b| {
        b.chunked_dataset(&ChunkedSpec {
            shape: &shape,
            chunk: &[4, 5],
            skip: &no_skip,
            deflate: false,
            leaf_size: 64,
            fill: None,
        })
    });
    let var = reader.variable("/data").unwrap();
    assert_eq!(var.layout.chunk_dims(), Some(&[4i64, 5, 8][..]));

    let all = reader.read(&var, None).unwrap();
    assert_eq!(f64s(&all), expected(&shape, &[(0, 9, 1), (0, 12, 1)]));

    let part = reader.read(&var, Some(&partial("2:7, 3:11"))).unwrap();
    assert_eq!(part.shape, vec![6, 9]);
    assert_eq!(f64s(&part), expected(&shape, &[(2, 7, 1), (3, 11, 1)]));

    let strided = reader.read(&var, Some(&partial("0:9:3, 1:12:4"))).unwrap();
    assert_eq!(strided.shape, vec![4, 3]);
    assert_eq!(f64s(&strided), expected(&shape, &[(0, 9, 3), (1, 12, 4)]));
}

#[test]
fn read_deflated_two_level_tree() {
    let shape = [9u64, 8, 7];
    let reader = single_dataset_file(|b| {
        b.chunked_dataset(&ChunkedSpec {
            shape: &shape,
            chunk: &[2, 3, 7],
            skip: &no_skip,
            deflate: true,
            leaf_size: 4,
            fill: None,
        })
    });
    let var = reader.variable("/data").unwrap();
    assert!(!var.filters.is_empty());

    let all = reader.read(&var, None).unwrap();
    assert_eq!(all.len(), 9 * 8 * 7);
    assert_eq!(f64s(&all), expected(&shape, &[(0, 8, 1), (0, 7, 1), (0, 6, 1)]));

    let part = reader.read(&var, Some(&partial("3, 2:6, :"))).unwrap();
    assert_eq!(f64s(&part), expected(&shape, &[(3, 3, 1), (2, 6, 1), (0, 6, 1)]));

    let index = reader.chunk_index(&var).unwrap();
    assert_eq!(index.kind(), "btree1");
    assert_eq!(index.chunks().count(), 5 * 3);
}

fn sparse_reader() -> Hdf5Reader {
    // every chunk whose row and column tile are both odd is missing
    let skip = |corner: &[u64]| (corner[0] / 3) % 2 == 1 && (corner[1] / 4) % 2 == 1;
    single_dataset_file(|b| {
        b.chunked_dataset(&ChunkedSpec {
            shape: &[20, 30],
            chunk: &[3, 4],
            skip: &skip,
            deflate: true,
            leaf_size: 8,
            fill: Some(7.0),
        })
    })
}

fn sparse_expected_sum() -> f64 {
    let mut sum = 0.0;
    for i in 0..20u64 {
        for j in 0..30u64 {
            let missing = (i / 3) % 2 == 1 && (j / 4) % 2 == 1;
            sum += if missing { 7.0 } else { linear_value(&[i, j], &[20, 30]) };
        }
    }
    sum
}

#[test]
fn read_sparse_chunks_use_fill_value() {
    let reader = sparse_reader();
    let var = reader.variable("/data").unwrap();
    let all = f64s(&reader.read(&var, None).unwrap());
    assert_eq!(all[3 * 30 + 4], 7.0);
    assert_eq!(all[3 * 30 + 3], linear_value(&[3, 3], &[20, 30]));
    assert_eq!(all.iter().sum::<f64>(), sparse_expected_sum());
}

#[test]
fn serial_iterator_matches_whole_read() {
    let reader = sparse_reader();
    let var = reader.variable("/data").unwrap();
    let whole = reader.read(&var, None).unwrap().sum_f64();

    let mut sum = 0.0;
    let mut elements = 0;
    let mut pieces = 0;
    for piece in reader.chunk_iter(&var, None).unwrap() {
        let piece = piece.unwrap();
        assert_eq!(piece.array.shape, piece.section.shape());
        sum += piece.array.sum_f64();
        elements += piece.array.len();
        pieces += 1;
    }
    assert_eq!(pieces, 7 * 8);
    assert_eq!(elements, 600);
    assert_eq!(sum, whole);
}

#[test]
fn concurrent_read_matches_serial_for_any_thread_count() {
    let reader = sparse_reader();
    let var = reader.variable("/data").unwrap();
    let want = partial("1:18, 2:27");
    let serial = reader.read(&var, Some(&want)).unwrap().sum_f64();

    for nthreads in [1, 2, 4, 8] {
        let mut sum = 0.0;
        let mut elements = 0;
        let done = AtomicUsize::new(0);
        reader
            .read_chunks_concurrent(
                &var,
                Some(&want),
                Some(nthreads),
                |piece| {
                    sum += piece.array.sum_f64();
                    elements += piece.array.len();
                },
                || {
                    done.fetch_add(1, Ordering::SeqCst);
                },
            )
            .unwrap();
        assert_eq!(done.load(Ordering::SeqCst), 1, "{} threads", nthreads);
        assert_eq!(elements, 18 * 26, "{} threads", nthreads);
        assert_eq!(sum, serial, "{} threads", nthreads);
    }
}

#[test]
fn concurrent_read_of_bad_section_still_calls_done() {
    let reader = sparse_reader();
    let var = reader.variable("/data").unwrap();
    let done = AtomicUsize::new(0);
    let mut pieces = 0;
    let result = reader.read_chunks_concurrent(
        &var,
        Some(&partial("0:25, 0:5")),
        Some(2),
        |_| pieces += 1,
        || {
            done.fetch_add(1, Ordering::SeqCst);
        },
    );
    assert!(matches!(result, Err(Error::OutOfRange(_))));
    assert_eq!(done.load(Ordering::SeqCst), 1);
    assert_eq!(pieces, 0);
}

#[test]
fn concurrent_iterator_over_contiguous_pieces() {
    let values: Vec<f64> = (0..1000).map(|v| v as f64).collect();
    init_logger();
    let mut b = H5Builder::new();
    let dataset = b.contiguous_f64(&[10, 100], &values);
    let root = b.group(&[("data", Member::Dataset(dataset))]);
    let config = ReaderConfig {
        max_section_elements: 150,
        ..ReaderConfig::default()
    };
    let opener = std::sync::Arc::new(h5chunk::MemoryOpener::new(b.finish(root)));
    let reader = Hdf5Reader::open_with(opener, config).unwrap();
    let var = reader.variable("/data").unwrap();

    let pieces: Vec<_> = reader
        .concurrent_chunk_iter(&var, None, Some(3))
        .unwrap()
        .collect::<Result<_, _>>()
        .unwrap();
    assert!(pieces.len() > 1);
    assert!(pieces.iter().all(|p| p.array.len() <= 150));
    let sum: f64 = pieces.iter().map(|p| p.array.sum_f64()).sum();
    assert_eq!(sum, values.iter().sum::<f64>());
}

#[test]
fn dropping_concurrent_iterator_early_stops_workers() {
    let reader = sparse_reader();
    let var = reader.variable("/data").unwrap();
    let mut iter = reader.concurrent_chunk_iter(&var, None, Some(4)).unwrap();
    assert!(iter.next().unwrap().is_ok());
    drop(iter);
}

// ---- Version 4 chunk indices ----

#[test]
fn read_fixed_array_index() {
    let shape = [6u64, 4];
    let reader = single_dataset_file(|b| {
        // 3 x 2 chunks of 2 x 2; chunk (1, 1) never written
        let mut addresses = Vec::new();
        for ti in 0..3u64 {
            for tj in 0..2u64 {
                if (ti, tj) == (1, 1) {
                    addresses.push(UNDEF);
                    continue;
                }
                let mut values = Vec::new();
                for i in 0..2 {
                    for j in 0..2 {
                        values.push(linear_value(&[ti * 2 + i, tj * 2 + j], &shape));
                    }
                }
                addresses.push(b.alloc(&f64_bytes(&values)));
            }
        }
        let header = b.fixed_array(&addresses);
        b.dataset(
            dataspace(&shape, None),
            datatype_float(8),
            layout_fixed_array(header, &[2, 2], 8, 10),
            None,
            None,
        )
    });
    let var = reader.variable("/data").unwrap();
    assert_eq!(reader.chunk_index(&var).unwrap().kind(), "fixed array");

    let all = f64s(&reader.read(&var, None).unwrap());
    let mut want = expected(&shape, &[(0, 5, 1), (0, 3, 1)]);
    for (i, j) in [(2, 2), (2, 3), (3, 2), (3, 3)] {
        want[i * 4 + j] = 0.0;
    }
    assert_eq!(all, want);
}

#[test]
fn read_extensible_array_index() {
    let shape = [12u64, 4];
    // tile (0, 1) is an index block element; tiles (5, 0) and (5, 1) make up
    // one data block page behind the super block
    let skip = |c: &[u64]| (c[0] == 0 && c[1] == 2) || c[0] == 10;
    for deflate in [false, true] {
        let reader = single_dataset_file(|b| {
            b.extensible_array_dataset(&ChunkedSpec {
                shape: &shape,
                chunk: &[2, 2],
                skip: &skip,
                deflate,
                leaf_size: 0,
                fill: Some(-1.5),
            })
        });
        let var = reader.variable("/data").unwrap();
        assert_eq!(var.max_shape, Some(vec![u64::MAX, 4]));

        let index = reader.chunk_index(&var).unwrap();
        assert_eq!(index.kind(), "extensible array");
        assert_eq!(index.chunks().count(), 12 - 3);
        assert!(index.find_chunk(&[0, 2]).unwrap().is_none());
        assert!(index.find_chunk(&[10, 0]).unwrap().is_none());
        let paged = index.find_chunk(&[8, 2]).unwrap().unwrap();
        assert_eq!(paged.offsets, vec![8, 2]);
        assert_eq!(paged.filter_mask.is_some(), deflate);

        let all = f64s(&reader.read(&var, None).unwrap());
        assert_eq!(all, expected_sparse(&shape, &[2, 2], &skip, -1.5), "deflate {}", deflate);

        let part = f64s(&reader.read(&var, Some(&partial("5:9, 1:2"))).unwrap());
        assert_eq!(part, expected(&shape, &[(5, 9, 1), (1, 2, 1)]));
    }
}

#[test]
fn read_btree2_index() {
    let shape = [6u64, 5];
    let skip = |c: &[u64]| c[0] == 2 && c[1] == 2;
    for deflate in [false, true] {
        let reader = single_dataset_file(|b| {
            b.btree2_dataset(&ChunkedSpec {
                shape: &shape,
                chunk: &[2, 2],
                skip: &skip,
                deflate,
                leaf_size: 0,
                fill: Some(3.25),
            })
        });
        let var = reader.variable("/data").unwrap();

        let index = reader.chunk_index(&var).unwrap();
        assert_eq!(index.kind(), "btree2");
        assert_eq!(index.chunks().count(), 9 - 1);
        assert!(index.find_chunk(&[2, 2]).unwrap().is_none());
        let corner = index.find_chunk(&[4, 4]).unwrap().unwrap();
        assert_eq!(corner.offsets, vec![4, 4]);
        assert_eq!(corner.filter_mask, deflate.then_some(0));

        let all = f64s(&reader.read(&var, None).unwrap());
        assert_eq!(all, expected_sparse(&shape, &[2, 2], &skip, 3.25), "deflate {}", deflate);

        let strided = f64s(&reader.read(&var, Some(&partial("0:5:2, 1:4:3"))).unwrap());
        assert_eq!(strided, expected(&shape, &[(0, 4, 2), (1, 4, 3)]));
    }
}

#[test]
fn read_single_chunk_and_implicit_indices() {
    let shape = [4u64, 6];
    let values = expected(&shape, &[(0, 3, 1), (0, 5, 1)]);

    let reader = single_dataset_file(|b| {
        let address = b.alloc(&f64_bytes(&values));
        b.dataset(
            dataspace(&shape, None),
            datatype_float(8),
            layout_single_chunk(address, &[4, 6], 8),
            None,
            None,
        )
    });
    let var = reader.variable("/data").unwrap();
    assert_eq!(f64s(&reader.read(&var, Some(&partial("1:2, :"))).unwrap()), values[6..18].to_vec());

    // implicit: chunks of 2 x 3 stored back to back in chunk order
    let reader = single_dataset_file(|b| {
        let mut bytes = Vec::new();
        for ti in 0..2u64 {
            for tj in 0..2u64 {
                let mut chunk = Vec::new();
                for i in 0..2 {
                    for j in 0..3 {
                        chunk.push(linear_value(&[ti * 2 + i, tj * 3 + j], &shape));
                    }
                }
                bytes.extend(f64_bytes(&chunk));
            }
        }
        let address = b.alloc(&bytes);
        b.dataset(
            dataspace(&shape, None),
            datatype_float(8),
            layout_implicit(address, &[2, 3], 8),
            None,
            None,
        )
    });
    let var = reader.variable("/data").unwrap();
    assert_eq!(f64s(&reader.read(&var, None).unwrap()), values);
}

// ---- Failures ----

#[test]
fn virtual_layout_is_unsupported() {
    let reader = single_dataset_file(|b| {
        b.dataset(dataspace(&[4], None), datatype_float(8), layout_virtual(), None, None)
    });
    let var = reader.variable("/data").unwrap();
    match reader.read(&var, None) {
        Err(Error::UnsupportedLayout(name)) => assert_eq!(name, "virtual"),
        other => panic!("unexpected {:?}", other),
    }
    assert!(reader.chunk_iter(&var, None).is_err());
}

#[test]
fn unknown_required_filter_fails_and_optional_is_skipped() {
    let build = |optional: bool| {
        single_dataset_file(|b| {
            let address = b.alloc(&f64_bytes(&[1.0, 2.0, 3.0, 4.0]));
            let records = vec![ChunkRecord {
                offsets: vec![0, 0],
                size: 32,
                filter_mask: 0,
                address,
            }];
            let btree = b.chunk_btree(2, &[records]);
            b.dataset(
                dataspace(&[4], None),
                datatype_float(8),
                layout_btree_v1(btree, &[4], 8),
                Some(unknown_pipeline(32000, optional)),
                None,
            )
        })
    };

    let reader = build(false);
    let var = reader.variable("/data").unwrap();
    assert!(matches!(
        reader.read(&var, None),
        Err(Error::UnsupportedFilter { id: 32000, .. })
    ));
    let mut calls = 0;
    let result = reader.read_chunks_concurrent(&var, None, Some(2), |_| {}, || calls += 1);
    assert!(matches!(result, Err(Error::UnsupportedFilter { .. })));
    assert_eq!(calls, 1);

    let reader = build(true);
    let var = reader.variable("/data").unwrap();
    assert_eq!(f64s(&reader.read(&var, None).unwrap()), vec![1.0, 2.0, 3.0, 4.0]);
}

#[test]
fn section_outside_variable_is_out_of_range() {
    let reader = single_dataset_file(|b| b.contiguous_f64(&[3], &[1.0, 2.0, 3.0]));
    let var = reader.variable("/data").unwrap();
    assert!(matches!(
        reader.read(&var, Some(&partial("1:3"))),
        Err(Error::OutOfRange(_))
    ));
    assert!(matches!(reader.variable("/nope"), Err(Error::ObjectNotFound(_))));
}

#[test]
fn zero_element_variable_reads_empty() {
    let reader = single_dataset_file(|b| {
        b.dataset(
            dataspace(&[0, 5], None),
            datatype_float(8),
            layout_contiguous(UNDEF, 0),
            None,
            None,
        )
    });
    let var = reader.variable("/data").unwrap();
    let array = reader.read(&var, None).unwrap();
    assert!(array.is_empty());
    assert_eq!(array.shape, vec![0, 5]);
    assert_eq!(reader.chunk_iter(&var, None).unwrap().count(), 0);
}

// ---- Files on disk ----

#[test]
fn read_memory_mapped_file() {
    init_logger();
    let mut b = H5Builder::new();
    let dataset = b.chunked_dataset(&ChunkedSpec {
        shape: &[7, 5],
        chunk: &[3, 3],
        skip: &no_skip,
        deflate: true,
        leaf_size: 2,
        fill: None,
    });
    let root = b.group(&[("weights", Member::Dataset(dataset))]);
    let mut tmp = NamedTempFile::new().unwrap();
    tmp.write_all(&b.finish(root)).unwrap();
    tmp.flush().unwrap();

    let reader = Hdf5Reader::open(tmp.path()).unwrap();
    assert_eq!(reader.variable_names(), vec!["/weights"]);
    let var = reader.variable("/weights").unwrap();
    let serial = reader.read(&var, None).unwrap();
    assert_eq!(f64s(&serial), expected(&[7, 5], &[(0, 6, 1), (0, 4, 1)]));

    let concurrent: f64 = reader
        .concurrent_chunk_iter(&var, None, Some(2))
        .unwrap()
        .map(|p| p.unwrap().array.sum_f64())
        .sum();
    assert_eq!(concurrent, serial.sum_f64());
}

#[test]
fn rejects_bad_magic_on_disk() {
    let mut tmp = NamedTempFile::new().unwrap();
    tmp.write_all(b"NOT_HDF5_MAGIC_BYTES").unwrap();
    tmp.flush().unwrap();
    assert!(matches!(
        Hdf5Reader::open(tmp.path()),
        Err(Error::InvalidMagicNumber { .. })
    ));
}
