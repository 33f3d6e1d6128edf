use revlm::autograd::{Variable, value_and_grad, vjp};
use revlm::tensor::Tensor;

#[test]
fn test_scalar_autograd() {
    // f(x) = x^2 + 3x, f'(2) = 7
    let x = Variable::leaf(Tensor::new(vec![2.0], vec![1]).unwrap());
    let three = Variable::constant(Tensor::new(vec![3.0], vec![1]).unwrap());
    let y = x.mul(&x).unwrap().add(&three.mul(&x).unwrap()).unwrap();
    assert_eq!(y.data().data()[0], 10.0);

    y.sum_all().backward().unwrap();
    assert_eq!(x.grad().unwrap().data()[0], 7.0);
}

#[test]
fn test_bmm_autograd() {
    // C = A @ B, dC/dA = B^T, dC/dB = A^T
    let a = Variable::leaf(Tensor::new(vec![1.0, 2.0], vec![1, 2]).unwrap());
    let b = Variable::leaf(Tensor::new(vec![3.0, 4.0], vec![2, 1]).unwrap());
    let c = a.bmm(&b).unwrap();
    assert_eq!(c.data().data()[0], 11.0);

    c.sum_all().backward().unwrap();
    assert_eq!(a.grad().unwrap().data(), &[3.0, 4.0]);
    assert_eq!(b.grad().unwrap().data(), &[1.0, 2.0]);
}

#[test]
fn test_custom_gradient_replaces_rule() {
    // Straight-through: forward doubles, backward passes the cotangent unchanged.
    let (out, grads) = vjp(
        |vars| {
            let doubled = vars[0].data().scale(2.0);
            Ok(Variable::custom("straight_through", doubled, vec![vars[0].clone()], |g| {
                Ok(vec![Some(g.clone())])
            }))
        },
        &[Tensor::new(vec![1.0, -1.0], vec![2]).unwrap()],
        Tensor::new(vec![0.5, 0.25], vec![2]).unwrap(),
    )
    .unwrap();
    assert_eq!(out.data(), &[2.0, -2.0]);
    assert_eq!(grads[0].data(), &[0.5, 0.25]);
}

#[test]
fn test_cross_entropy_gradient_is_softmax_minus_onehot() {
    let logits = Tensor::new(vec![0.0, 0.0, 0.0, 0.0], vec![1, 4]).unwrap();
    let (loss, grad) = value_and_grad(|x| Ok(x.cross_entropy(&[2], 0.0)?.mean_all()), logits).unwrap();
    assert!((loss - 4f32.ln()).abs() < 1e-6);
    let expected = [0.25, 0.25, -0.75, 0.25];
    for (g, e) in grad.data().iter().zip(expected) {
        assert!((g - e).abs() < 1e-6);
    }
}
