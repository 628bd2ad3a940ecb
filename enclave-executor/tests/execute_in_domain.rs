//! Integration tests for running work inside isolation domains.

use enclave_core::{DivideByZero, MarshalError, Panicked, RemoteFault};
use enclave_executor::{
    execute_in_domain, Callable, Catalog, CatalogError, CodeUnit, DomainConfig, FieldReader,
    FieldWriter, Marshalable, Sandbox, SandboxError,
};
use serde::{Deserialize, Serialize};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Line {
    sku: String,
    qty: i64,
    price: i64,
}

/// Walked field by field; `memo` stays on the side that created it.
#[derive(Debug, Clone, PartialEq)]
struct Order {
    customer: String,
    lines: Vec<Line>,
    memo: Option<String>,
}

impl Marshalable for Order {
    const TYPE_TAG: &'static str = "order";

    fn write_fields(&self, fields: &mut FieldWriter<'_>) -> Result<(), MarshalError> {
        fields.value("customer", &self.customer)?;
        fields.value("lines", &self.lines)
    }

    fn read_fields(fields: &FieldReader<'_>) -> Result<Self, MarshalError> {
        Ok(Self { customer: fields.value("customer")?, lines: fields.value("lines")?, memo: None })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Greeter {
    greeting: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, thiserror::Error)]
#[error("quota exceeded by {over}")]
struct QuotaExceeded {
    over: u32,
}

#[derive(Debug, thiserror::Error)]
#[error("account {account} would be overdrawn")]
struct Overdraft {
    account: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct HostToken(u32);

fn commerce_unit() -> CodeUnit {
    CodeUnit::new("commerce", |catalog: &mut Catalog| {
        catalog.register_direct::<Line>("line")?;
        catalog.register_direct::<Vec<Line>>("vec<line>")?;
        catalog.register::<Order>()
    })
}

fn greeter_unit() -> CodeUnit {
    CodeUnit::new("greeter", |catalog: &mut Catalog| {
        catalog.register_direct::<Greeter>("greeter")?;
        catalog.register_method("greeter.greet", |g: &mut Greeter, name: String| {
            Ok::<_, DivideByZero>(format!("{}, {name}", g.greeting))
        })
    })
}

fn quota_unit() -> CodeUnit {
    CodeUnit::new("quota", |catalog: &mut Catalog| {
        catalog.register_direct::<QuotaExceeded>("QuotaExceeded")?;
        catalog.register_fault::<QuotaExceeded>()
    })
}

/// Loads on the caller side but declines inside any domain context.
fn host_only_unit() -> CodeUnit {
    CodeUnit::new("host-only", |catalog: &mut Catalog| {
        let in_domain =
            std::thread::current().name().is_some_and(|name| name.starts_with("enclave-"));
        if in_domain {
            return Err(CatalogError::Unavailable { reason: "host resources only".to_owned() });
        }
        catalog.register_direct::<HostToken>("host-token")
    })
}

#[tokio::test]
async fn increments_in_isolated_domain() {
    init_tracing();
    let inc = Callable::new(|x: i64| x + 1);
    let answer: i64 = execute_in_domain("worker", &inc, &41_i64).await.expect("execute");
    assert_eq!(answer, 42);
}

#[tokio::test]
async fn divide_by_zero_is_reraised_with_type_and_message() {
    init_tracing();
    let div = Callable::optional(|_: Option<i64>| Err::<i64, _>(DivideByZero));
    let result = Sandbox::global().execute_in_domain_opt::<i64, i64>("worker", &div, None).await;
    match result {
        Err(SandboxError::Isolated(fault)) => {
            assert_eq!(fault.type_name(), "DivideByZero");
            assert_eq!(fault.message(), DivideByZero.to_string());
            assert!(fault.is::<DivideByZero>(), "registered fault must be rebuilt as itself");
            assert!(!fault.stack_trace().is_empty(), "stack trace must survive the boundary");
        }
        other => panic!("expected an isolated fault, got {other:?}"),
    }
}

#[tokio::test]
async fn panic_is_contained_and_reraised() {
    init_tracing();
    let sandbox = Sandbox::new();
    let boom = Callable::new(|_: i64| -> i64 { panic!("worker exploded") });
    let result = sandbox.execute_in_domain::<i64, i64>("panicky", &boom, &1).await;
    match result {
        Err(SandboxError::Isolated(fault)) => {
            assert_eq!(fault.type_name(), "Panicked");
            let panicked = fault.downcast_ref::<Panicked>();
            assert!(panicked.is_some_and(|p| p.message.contains("worker exploded")));
        }
        other => panic!("expected a contained panic, got {other:?}"),
    }
    assert!(sandbox.registry().is_empty(), "domain must be disposed after a panic");
}

#[tokio::test]
async fn composite_state_crosses_field_by_field() {
    init_tracing();
    let sandbox = Sandbox::new();
    sandbox.load_unit(commerce_unit()).expect("load commerce");

    let order = Order {
        customer: "ada".to_owned(),
        lines: vec![
            Line { sku: "bolt".to_owned(), qty: 3, price: 20 },
            Line { sku: "nut".to_owned(), qty: 4, price: 5 },
        ],
        memo: Some("deliver after noon".to_owned()),
    };
    let total = Callable::new(|order: Order| {
        assert!(order.memo.is_none(), "excluded field must not cross");
        order.lines.iter().map(|line| line.qty * line.price).sum::<i64>()
    });
    let sum: i64 = sandbox.execute_in_domain("billing", &total, &order).await.expect("execute");
    assert_eq!(sum, 80);

    let restock = Callable::new(|mut order: Order| {
        order.lines.retain(|line| line.qty > 3);
        order
    });
    let kept: Order =
        sandbox.execute_in_domain("restock", &restock, &order).await.expect("execute");
    assert_eq!(kept.customer, "ada");
    assert_eq!(kept.lines.len(), 1);
    assert_eq!(order.lines.len(), 2, "the caller's state is copied, never shared");
}

#[tokio::test]
async fn bound_method_runs_against_target_snapshot() {
    init_tracing();
    let sandbox = Sandbox::new();
    sandbox.load_unit(greeter_unit()).expect("load greeter");
    let greeter = Greeter { greeting: "hello".to_owned() };
    let greet = sandbox.bind(greeter, "greeter.greet").expect("bind");
    let text: String =
        sandbox.execute_in_domain("greeter", &greet, &"Ada".to_owned()).await.expect("execute");
    assert_eq!(text, "hello, Ada");
}

#[tokio::test]
async fn captured_state_is_copied_when_the_call_is_made() {
    init_tracing();
    let sandbox = Sandbox::new();
    sandbox.load_unit(greeter_unit()).expect("load greeter");
    let greeter = Greeter { greeting: "hello".to_owned() };
    let mut greet =
        Callable::capture(greeter, |g: &Greeter, name: String| format!("{}, {name}", g.greeting));

    let run = sandbox.execute_in_domain::<String, String>("captured", &greet, &"Ada".to_owned());
    if let Some(greeter) = greet.target_mut::<Greeter>() {
        greeter.greeting = "bye".to_owned();
    }
    assert_eq!(run.await.expect("execute"), "hello, Ada");

    let text: String =
        sandbox.execute_in_domain("captured", &greet, &"Ada".to_owned()).await.expect("execute");
    assert_eq!(text, "bye, Ada", "each call copies the state as it is then");
}

#[tokio::test]
async fn non_finite_floats_cross_intact() {
    init_tracing();
    let sandbox = Sandbox::new();
    let reciprocal = Callable::new(|x: f64| 1.0 / x);
    let inf: f64 =
        sandbox.execute_in_domain("reciprocal", &reciprocal, &0.0_f64).await.expect("execute");
    assert_eq!(inf, f64::INFINITY);
    let neg: f64 =
        sandbox.execute_in_domain("reciprocal", &reciprocal, &-0.0_f64).await.expect("execute");
    assert_eq!(neg, f64::NEG_INFINITY);

    let halve = Callable::new(|xs: Vec<f64>| xs.into_iter().map(|x| x / 2.0).collect::<Vec<_>>());
    let halves: Vec<f64> = sandbox
        .execute_in_domain("halve", &halve, &vec![f64::INFINITY, 3.0])
        .await
        .expect("execute");
    assert_eq!(halves, [f64::INFINITY, 1.5]);
}

#[tokio::test]
async fn registered_custom_fault_is_rebuilt_as_itself() {
    init_tracing();
    let sandbox = Sandbox::new();
    sandbox.load_unit(quota_unit()).expect("load quota");
    let spend = Callable::try_new(|amount: u32| {
        if amount > 10 {
            Err(QuotaExceeded { over: amount - 10 })
        } else {
            Ok(amount)
        }
    });
    match sandbox.execute_in_domain::<u32, u32>("spender", &spend, &15).await {
        Err(SandboxError::Isolated(fault)) => {
            assert_eq!(fault.downcast_ref::<QuotaExceeded>(), Some(&QuotaExceeded { over: 5 }));
        }
        other => panic!("expected QuotaExceeded, got {other:?}"),
    }
}

#[tokio::test]
async fn unregistered_fault_keeps_type_name_and_message() {
    init_tracing();
    let sandbox = Sandbox::new();
    let withdraw = Callable::try_new(|amount: i64| {
        if amount > 100 {
            Err(Overdraft { account: "acc-1".to_owned() })
        } else {
            Ok(100 - amount)
        }
    });
    match sandbox.execute_in_domain::<i64, i64>("bank", &withdraw, &500).await {
        Err(SandboxError::Isolated(fault)) => {
            assert_eq!(fault.type_name(), "Overdraft");
            assert_eq!(fault.message(), "account acc-1 would be overdrawn");
            assert!(fault.is::<RemoteFault>(), "unregistered fault falls back to a remote fault");
            assert!(fault.to_string().contains("Overdraft"));
        }
        other => panic!("expected an isolated Overdraft, got {other:?}"),
    }
}

#[tokio::test]
async fn nested_domain_fault_passes_through_unchanged() {
    init_tracing();
    let outer = Callable::try_new(|n: i64| -> Result<i64, SandboxError> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|e| SandboxError::SpawnFailed(e.to_string()))?;
        let div = Callable::try_new(|d: i64| if d == 0 { Err(DivideByZero) } else { Ok(10 / d) });
        runtime.block_on(Sandbox::global().execute_in_domain("inner", &div, &n))
    });
    let sandbox = Sandbox::new();
    match sandbox.execute_in_domain::<i64, i64>("outer", &outer, &0).await {
        Err(SandboxError::Isolated(fault)) => {
            assert_eq!(fault.type_name(), "DivideByZero");
            assert!(fault.is::<DivideByZero>());
        }
        other => panic!("expected the inner fault, got {other:?}"),
    }
}

#[tokio::test]
async fn type_not_loaded_in_domain_cannot_cross() {
    init_tracing();
    let sandbox = Sandbox::new();
    sandbox.load_unit(host_only_unit()).expect("host loads the unit");

    let handle = sandbox.create_domain("partial").await.expect("create");
    assert!(handle.loaded_units().is_empty());
    assert_eq!(handle.skipped_units().len(), 1);
    assert_eq!(handle.skipped_units()[0].unit, "host-only");

    let peek = Callable::new(|token: HostToken| token.0);
    let result = sandbox.invoke::<HostToken, u32>(&handle, &peek, &HostToken(7)).await;
    assert!(result.as_ref().is_err_and(SandboxError::is_unsupported_type), "got {result:?}");
    sandbox.dispose_domain(&handle).await.expect("dispose");
}

#[tokio::test]
async fn required_unit_that_fails_to_load_aborts_creation() {
    init_tracing();
    let sandbox = Sandbox::with_config(DomainConfig::new().with_required_unit("host-only"));
    sandbox.load_unit(host_only_unit()).expect("host loads the unit");

    match sandbox.create_domain("strict").await {
        Err(SandboxError::UnitLoadFailed { unit, reason }) => {
            assert_eq!(unit, "host-only");
            assert!(reason.contains("host resources only"), "reason was {reason}");
        }
        other => panic!("expected UnitLoadFailed, got {other:?}"),
    }
    assert!(sandbox.registry().is_empty(), "failed creation must not register anything");
}

#[tokio::test]
async fn unregistered_state_type_is_rejected_before_any_domain_exists() {
    init_tracing();
    struct Socket;
    let sandbox = Sandbox::new();
    let noop = Callable::new(|_: Socket| 0_i64);
    let result = sandbox.execute_in_domain::<Socket, i64>("io", &noop, &Socket).await;
    assert!(result.as_ref().is_err_and(SandboxError::is_unsupported_type));
    assert!(sandbox.registry().is_empty());
}

#[tokio::test]
async fn empty_callable_is_missing() {
    init_tracing();
    let sandbox = Sandbox::new();
    let result = sandbox.execute_in_domain::<i64, i64>("idle", &Callable::empty(), &1).await;
    assert!(matches!(result, Err(SandboxError::MissingCallable)));
    assert!(sandbox.registry().is_empty());
}

#[tokio::test]
async fn object_graph_deeper_than_limit_is_rejected() {
    init_tracing();
    #[derive(Debug)]
    struct Chain(Option<Box<Chain>>);
    impl Marshalable for Chain {
        const TYPE_TAG: &'static str = "chain";
        fn write_fields(&self, fields: &mut FieldWriter<'_>) -> Result<(), MarshalError> {
            fields.optional("next", self.0.as_deref())
        }
        fn read_fields(fields: &FieldReader<'_>) -> Result<Self, MarshalError> {
            Ok(Self(fields.optional::<Chain>("next")?.map(Box::new)))
        }
    }

    let sandbox = Sandbox::with_config(DomainConfig::new().with_max_depth(8));
    sandbox
        .load_unit(CodeUnit::new("chain", |catalog: &mut Catalog| catalog.register::<Chain>()))
        .expect("load chain");
    let long = (0..32).fold(Chain(None), |next, _| Chain(Some(Box::new(next))));
    let count = Callable::new(|_: Chain| 0_u32);
    let result = sandbox.execute_in_domain::<Chain, u32>("deep", &count, &long).await;
    assert!(
        matches!(result, Err(SandboxError::Marshal(MarshalError::DepthExceeded { limit: 8 }))),
        "got {result:?}"
    );
}
