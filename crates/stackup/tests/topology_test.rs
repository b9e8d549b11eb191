use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use stackup::{Service, ServiceId, Topology, TopologyError};
use std::collections::HashMap;

/// Services `s0..sN`, each depending on a few lower-numbered ones, declared in shuffled order.
fn random_dag(rng: &mut StdRng, size: usize) -> Vec<Service> {
    let mut services: Vec<Service> = (0..size)
        .map(|i| {
            let mut service = Service::new(format!("s{i}"), "img:latest");
            if i > 0 {
                for _ in 0..rng.gen_range(0..4) {
                    service = service.depends_on(format!("s{}", rng.gen_range(0..i)));
                }
            }
            service
        })
        .collect();

    services.shuffle(rng);
    services
}

#[test]
fn test_start_order_respects_every_dependency() {
    let mut rng = StdRng::seed_from_u64(0x5eed);

    for round in 0..50 {
        let services = random_dag(&mut rng, 2 + round % 25);
        let mut builder = Topology::builder();
        builder.add_services(services.clone()).unwrap();
        let topology = builder.build().unwrap();

        let order = topology.resolve_start_order().unwrap();
        assert_eq!(order.len(), services.len());

        let position: HashMap<&ServiceId, usize> =
            order.iter().enumerate().map(|(i, id)| (id, i)).collect();
        for service in &services {
            for dependency in &service.depends_on {
                assert!(
                    position[dependency] < position[&service.id],
                    "round {round}: {} started before its dependency {}",
                    service.id,
                    dependency
                );
            }
        }

        let mut stop = topology.resolve_stop_order().unwrap();
        stop.reverse();
        assert_eq!(stop, order);
    }
}

#[test]
fn test_cycle_is_detected() {
    let mut builder = Topology::builder();
    builder.add_service(Service::new("db", "postgres:15")).unwrap();

    let err = builder
        .add_services([
            Service::new("a", "img").depends_on("db").depends_on("c"),
            Service::new("b", "img").depends_on("a"),
            Service::new("c", "img").depends_on("b"),
        ])
        .unwrap_err();

    let TopologyError::CyclicDependency(member) = &err else {
        panic!("expected a cycle, got {err}");
    };
    assert!(["a", "b", "c"].contains(&member.as_str()));
    assert_eq!(builder.build().unwrap_err(), err);
}

#[test]
fn test_duplicate_host_port_is_rejected_before_anything_runs() {
    let mut builder = Topology::builder();
    builder
        .add_service(Service::new("bot", "bot:latest").with_port(8000, 8000))
        .unwrap();

    let err = builder
        .add_service(Service::new("admin", "admin:latest").with_port(8000, 80))
        .unwrap_err();

    assert_eq!(
        err,
        TopologyError::PortConflict {
            port: 8000,
            first: "bot".into(),
            second: "admin".into(),
        }
    );
    assert!(builder.build().is_err());
}

#[test]
fn test_same_container_port_on_different_host_ports_is_fine() {
    let mut builder = Topology::builder();
    builder
        .add_service(Service::new("a", "img").with_port(8001, 80))
        .unwrap();
    builder
        .add_service(Service::new("b", "img").with_port(8002, 80))
        .unwrap();

    assert_eq!(builder.build().unwrap().len(), 2);
}

#[test]
fn test_diamond_orders_shared_dependency_first() {
    let mut builder = Topology::builder();
    builder.add_service(Service::new("db", "postgres:15")).unwrap();
    builder
        .add_service(Service::new("api", "api").depends_on("db"))
        .unwrap();
    builder
        .add_service(Service::new("worker", "worker").depends_on("db"))
        .unwrap();
    builder
        .add_service(
            Service::new("gateway", "gw")
                .depends_on("api")
                .depends_on("worker"),
        )
        .unwrap();
    let topology = builder.build().unwrap();

    let order: Vec<String> = topology
        .resolve_start_order()
        .unwrap()
        .iter()
        .map(ToString::to_string)
        .collect();
    assert_eq!(order, ["db", "api", "worker", "gateway"]);

    let dependents: Vec<&str> = topology
        .dependents(&"db".into())
        .into_iter()
        .map(ServiceId::as_str)
        .collect();
    assert_eq!(dependents, ["api", "worker"]);
}
