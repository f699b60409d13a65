//! Kernel-level scenarios run against the CPU engine through the public API.

use gradix::{CpuEngine, Engine, Error, RunContext, Tensor};
use half::{bf16, f16};

fn ctx() -> RunContext {
    RunContext::new()
}

#[test]
fn broadcast_add_matches_reference() {
    let e = CpuEngine::new();
    let a = Tensor::<f32>::from_vec([2, 3], vec![1., 2., 3., 4., 5., 6.]).unwrap();
    let b = Tensor::<f32>::from_vec([3], vec![10., 20., 30.]).unwrap();
    let c = e.add(&ctx(), &a, &b, None).unwrap();
    assert_eq!(c.dims(), &[2, 3]);
    assert_eq!(c.data(), &[11., 22., 33., 14., 25., 36.]);
}

#[test]
fn matmul_matches_reference() {
    let e = CpuEngine::new();
    let a = Tensor::<f32>::from_vec([2, 3], vec![1., 2., 3., 4., 5., 6.]).unwrap();
    let b = Tensor::<f32>::from_vec([3, 2], vec![1., 2., 3., 4., 5., 6.]).unwrap();
    let c = e.matmul(&ctx(), &a, &b, None).unwrap();
    assert_eq!(c.data(), &[22., 28., 49., 64.]);

    let bad = Tensor::<f32>::zeros([4, 2]);
    assert!(matches!(
        e.matmul(&ctx(), &a, &bad, None),
        Err(Error::ShapeMismatch { .. })
    ));
}

#[test]
fn gather_selects_rows() {
    let e = CpuEngine::new();
    let params = Tensor::<f32>::from_vec([3, 2], vec![1., 2., 3., 4., 5., 6.]).unwrap();
    let indices = Tensor::<f32>::from_vec([2], vec![2., 0.]).unwrap();
    let out = e.gather(&ctx(), &params, &indices, None).unwrap();
    assert_eq!(out.dims(), &[2, 2]);
    assert_eq!(out.data(), &[5., 6., 1., 2.]);
}

#[test]
fn transpose_involution() {
    let e = CpuEngine::new();
    let t = Tensor::<f32>::from_vec([2, 3, 4], (0..24).map(|v| v as f32).collect()).unwrap();
    let perm = [2, 0, 1];
    let inverse = [1, 2, 0];
    let u = e.transpose(&ctx(), &t, &perm, None).unwrap();
    assert_eq!(u.dims(), &[4, 2, 3]);
    let back = e.transpose(&ctx(), &u, &inverse, None).unwrap();
    assert_eq!(back.data(), t.data());
}

#[test]
fn reshape_preserves_iteration_order() {
    let e = CpuEngine::new();
    let t = Tensor::<f32>::from_vec([2, 3], vec![1., 2., 3., 4., 5., 6.]).unwrap();
    let u = e.reshape(&ctx(), &t, &[3, 2], None).unwrap();
    assert_eq!(u.data(), t.data());
    assert!(e.reshape(&ctx(), &t, &[4, 2], None).is_err());
}

#[test]
fn scalar_kernels() {
    let e = CpuEngine::new();
    let t = Tensor::<f32>::from_vec([3], vec![1., 2., 3.]).unwrap();
    assert_eq!(
        e.add_scalar(&ctx(), &t, 1.0, None).unwrap().data(),
        &[2., 3., 4.]
    );
    assert_eq!(
        e.mul_scalar(&ctx(), &t, 2.0, None).unwrap().data(),
        &[2., 4., 6.]
    );
    assert_eq!(
        e.div_scalar(&ctx(), &t, 2.0, None).unwrap().data(),
        &[0.5, 1.0, 1.5]
    );
}

#[test]
fn transcendental_kernels() {
    let e = CpuEngine::new();
    let t = Tensor::<f64>::from_vec([2], vec![4.0, 9.0]).unwrap();
    assert_eq!(e.sqrt(&ctx(), &t, None).unwrap().data(), &[2.0, 3.0]);
    assert_eq!(e.rsqrt(&ctx(), &t, None).unwrap().data(), &[0.5, 1.0 / 3.0]);
    let logs = e.log(&ctx(), &t, None).unwrap();
    let back = e.exp(&ctx(), &logs, None).unwrap();
    for (a, b) in back.data().iter().zip(t.data()) {
        assert!((a - b).abs() < 1e-12);
    }
    let p = e
        .pow(&ctx(), &t, &Tensor::from_vec([2], vec![0.5, 0.5]).unwrap(), None)
        .unwrap();
    for (got, want) in p.data().iter().zip([2.0, 3.0]) {
        assert!((got - want).abs() < 1e-12);
    }
}

#[test]
fn half_precision_lanes_compute() {
    let e = CpuEngine::new();
    let a = Tensor::<f16>::from_vec([2], vec![f16::from_f64(1.5), f16::from_f64(2.5)]).unwrap();
    let s = e.add(&ctx(), &a, &a, None).unwrap();
    assert_eq!(s.data()[0].to_f64(), 3.0);

    let b = Tensor::<bf16>::from_vec([2], vec![bf16::from_f64(2.0), bf16::from_f64(4.0)]).unwrap();
    let m = e.mul(&ctx(), &b, &b, None).unwrap();
    assert_eq!(m.data()[1].to_f64(), 16.0);
}

#[test]
fn repeat_and_fill() {
    let e = CpuEngine::new();
    let t = Tensor::<f32>::from_vec([2, 1], vec![1., 2.]).unwrap();
    let r = e.repeat(&ctx(), &t, 1, 3, None).unwrap();
    assert_eq!(r.dims(), &[2, 3]);
    assert_eq!(r.data(), &[1., 1., 1., 2., 2., 2.]);

    let f = e.fill(&ctx(), &[2, 2], 7.0f32, None).unwrap();
    assert!(f.data().iter().all(|&v| v == 7.0));
}

#[test]
fn uneven_split_is_invalid() {
    let e = CpuEngine::new();
    let t = Tensor::<f32>::zeros([2, 5]);
    assert!(matches!(
        e.split(&ctx(), &t, 1, 2),
        Err(Error::InvalidArgument(_))
    ));
}

#[test]
fn supplied_destination_is_reused() {
    let e = CpuEngine::new();
    let a = Tensor::<f32>::from_vec([2], vec![1., 2.]).unwrap();
    let dst = Tensor::<f32>::zeros([2]);
    let out = e.mul(&ctx(), &a, &a, Some(dst)).unwrap();
    assert_eq!(out.data(), &[1., 4.]);
}

#[test]
fn cancellation_surfaces_from_any_kernel() {
    let e = CpuEngine::new();
    let c = RunContext::new();
    c.cancel();
    let t = Tensor::<f32>::zeros([2, 2]);
    assert!(matches!(e.matmul(&c, &t, &t, None), Err(Error::Cancelled)));
    assert!(matches!(e.reduce_sum(&c, &t, &[0], false, None), Err(Error::Cancelled)));
}
