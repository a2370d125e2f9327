/// Example joining two hosts back to back: the central opens EATT bearers,
/// sends a read request over them and resizes them. A plain LE credit based
/// channel on a dynamic PSM runs next to them.
use bluecoc::eatt::*;
use bluecoc::l2cap::*;
use bluecoc::runtime::*;
use bluecoc::Host;
use bluecoc::TransportError;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

const HANDLE: ConnHandle = 0x0040;

/// Frame sink that hands frames straight to the other host's receive path
#[derive(Default)]
struct Wire {
    peer: Mutex<Option<ReceivePath>>,
}

impl FrameSink for Wire {
    fn send_frame(&self, handle: ConnHandle, cid: ChannelId, payload: &[u8]) -> Result<(), TransportError> {
        let peer = self
            .peer
            .lock()
            .map_err(|_| TransportError::LinkUnavailable(handle))?;

        match peer.as_ref() {
            Some(path) => path.deliver(handle, cid, payload).map(|_| ()),
            None => Err(TransportError::LinkUnavailable(handle)),
        }
    }
}

/// One sleeping thread per armed timer; stopped timers are ignored when they fire
struct ThreadTimers {
    sender: EventSender,
    generations: Arc<Mutex<HashMap<TimerId, u64>>>,
}

impl TimerService for ThreadTimers {
    fn start(&self, id: TimerId, after: Duration) -> Result<(), TransportError> {
        let generation = {
            let mut generations = self
                .generations
                .lock()
                .map_err(|e| TransportError::Timer(e.to_string()))?;
            let entry = generations.entry(id).or_insert(0);
            *entry += 1;
            *entry
        };

        let sender = self.sender.clone();
        let generations = self.generations.clone();
        thread::spawn(move || {
            thread::sleep(after);
            let current = generations.lock().ok().and_then(|g| g.get(&id).copied());
            if current == Some(generation) {
                let _ = sender.post(Event::TimerExpired(id));
            }
        });

        Ok(())
    }

    fn stop(&self, id: TimerId) {
        if let Ok(mut generations) = self.generations.lock() {
            if let Some(generation) = generations.get_mut(&id) {
                *generation += 1;
            }
        }
    }
}

/// ATT side that prints what it sees; the server answers every request
struct Printer {
    name: &'static str,
    answer: bool,
}

impl AttBearerHandler for Printer {
    fn pdu_received(&mut self, handle: ConnHandle, bearer: Bearer, pdu: &[u8], tx: &mut dyn BearerSender) {
        println!("[{}] link {:#06x} {:?}: {}", self.name, handle, bearer, hex::encode(pdu));
        if self.answer && bearer::expects_reply(pdu[0]) {
            if let Err(e) = tx.send(bearer, vec![0x0B, b'h', b'i']) {
                eprintln!("[{}] reply failed: {}", self.name, e);
            }
        }
    }

    fn send_confirmed(&mut self, _handle: ConnHandle, bearer: Bearer, _tx: &mut dyn BearerSender) -> bool {
        println!("[{}] sent on {:?}", self.name, bearer);
        false
    }

    fn flow_enabled(&mut self, _handle: ConnHandle, _bearer: Bearer, _tx: &mut dyn BearerSender) -> bool {
        false
    }
}

fn build_host(name: &'static str, wire: Arc<Wire>) -> Result<Host, Box<dyn std::error::Error>> {
    let queue = EventQueue::new();
    let timers = Arc::new(ThreadTimers {
        sender: queue.sender(),
        generations: Arc::new(Mutex::new(HashMap::new())),
    });

    let l2cap = L2capManager::new(
        L2capConfig::default(),
        wire,
        timers.clone(),
        Arc::new(HeapBuffers::default()),
    );

    let events: EattEventCallback = Arc::new(Mutex::new(move |event: EattEvent| -> EattResult<()> {
        println!("[{}] {:?}", name, event);
        Ok(())
    }));

    let eatt = EattManager::new(
        EattConfig {
            num_channels: 3,
            priorities: vec![0, 1, 2],
            ..Default::default()
        },
        timers,
        Box::new(Printer {
            name: "client",
            answer: false,
        }),
        Box::new(Printer { name, answer: true }),
    )?
    .with_events(events);

    Ok(Host::with_queue(queue, l2cap).with_eatt(eatt)?)
}

fn coc_printer(name: &'static str) -> CocEventCallback {
    Arc::new(Mutex::new(move |event: CocEvent| -> L2capResult<()> {
        match event {
            CocEvent::DataReceived { cid, sdu, .. } => {
                println!("[{}] channel 0x{:04X} got {}", name, cid, hex::encode(&sdu))
            }
            other => println!("[{}] {:?}", name, other),
        }
        Ok(())
    }))
}

fn run(central: &mut Host, peripheral: &mut Host, rounds: usize) {
    for _ in 0..rounds {
        central.run_until_idle();
        peripheral.run_until_idle();
        thread::sleep(Duration::from_millis(5));
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    println!("EATT Loopback Example");
    println!("---------------------");

    let to_peripheral = Arc::new(Wire::default());
    let to_central = Arc::new(Wire::default());

    let mut central = build_host("central", to_peripheral.clone())?;
    let mut peripheral = build_host("peripheral", to_central.clone())?;

    *to_peripheral.peer.lock().map_err(|e| e.to_string())? = Some(peripheral.receive_path());
    *to_central.peer.lock().map_err(|e| e.to_string())? = Some(central.receive_path());

    // Both sides agree on one dynamic PSM for the plain channel
    let psm = obtain_dynamic_psm();
    let mut registrations = Vec::new();
    for (host, name) in [(&mut central, "central"), (&mut peripheral, "peripheral")] {
        let registration = Registration::new(psm, RoleMask::all(), LeCreditBasedConfig::default(), coc_printer(name));
        registrations.push(host.l2cap_mut().register(registration)?);
    }

    for (host, role) in [(&central, LinkRole::Central), (&peripheral, LinkRole::Peripheral)] {
        host.sender().post(Event::LinkOpened {
            handle: HANDLE,
            conn_id: 0,
            role,
            conn_interval: Duration::from_millis(30),
        })?;
    }

    // Long enough for the peripheral's backoff to run out
    run(&mut central, &mut peripheral, 60);

    println!("\nSending a read request");
    let bearer = central.eatt_send(HANDLE, 1, vec![0x0A, 0x03, 0x00])?;
    println!("Request went out on {:?}", bearer);
    run(&mut central, &mut peripheral, 5);

    println!("\nOpening a channel on {}", psm);
    let cid = central.l2cap_mut().connect(registrations[0], HANDLE)?;
    run(&mut central, &mut peripheral, 5);
    central.l2cap_mut().send(cid, b"hello".to_vec())?;
    run(&mut central, &mut peripheral, 5);

    println!("\nGrowing every bearer to 512 bytes");
    central.eatt_reconfigure(HANDLE, 512, 247)?;
    run(&mut central, &mut peripheral, 5);

    println!("\nClosing the link");
    for host in [&central, &peripheral] {
        host.sender().post(Event::LinkClosed { handle: HANDLE })?;
    }
    run(&mut central, &mut peripheral, 2);

    Ok(())
}
