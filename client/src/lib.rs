//! klangraum-client – Bibliotheks-Root
//!
//! Verdrahtet Routing-Matrix, Mix-Engine, Peer-Supervisor, UDP-Direktpfad
//! und Signaling-Verbindung zu einem laufenden Client.
//!
//! ```text
//! Signaling (TCP) --KanalNachricht--> SupervisorTask --FrameEingang--> RoutingMatrix
//! UDP-Direktpfad --TransportEreignis--^                                  |
//!                                                         MixEngine (eigener Thread)
//!                                                                        |
//!                                                            AudioSink pro Bus
//! ```

pub mod config;
pub mod signaling;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use config::ClientConfig;
use klangraum_audio::{
    Aufnahme, AufnahmeConfig, MixEngine, ReloadBericht, RoutingMatrix, SpeicherAbzug,
    StandardSinkFabrik,
};
use klangraum_core::{AudioFormat, BusId, EreignisKanal, ParticipantId, QuellenRegister};
use klangraum_observability::{HealthState, KlangraumMetriken};
use klangraum_protocol::KanalNachricht;
use klangraum_voice::task::STANDARD_TAKT;
use klangraum_voice::{PeerSupervisor, SupervisorHandle, SupervisorTask, UdpDirektTransport};
use signaling::SignalingVerbindung;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Kapazitaet der Queue vom UDP-Empfangs-Task zum Supervisor
const TRANSPORT_KAPAZITAET: usize = 1024;

/// Kapazitaet der Queue vom Signaling-Leser zum Supervisor
const KANAL_KAPAZITAET: usize = 1024;

/// Haelt den laufenden Client-Zustand zusammen
pub struct Client {
    config: ClientConfig,
    matrix: RoutingMatrix,
    fabrik: Arc<StandardSinkFabrik>,
    ereignisse: EreignisKanal,
    metriken: KlangraumMetriken,
    health: HealthState,
    supervisor: SupervisorHandle,
    engine: Option<MixEngine>,
    supervisor_task: Option<JoinHandle<()>>,
    hintergrund: Vec<JoinHandle<()>>,
    _signaling: SignalingVerbindung,
    _aufnahme: Option<Aufnahme>,
}

impl Client {
    /// Startet alle Client-Subsysteme
    ///
    /// Reihenfolge:
    /// 1. Routing-Matrix mit Bussen und Vorgaben aus der Konfiguration
    /// 2. Mix-Engine (eigener Thread)
    /// 3. UDP-Direktpfad und Signaling-Verbindung
    /// 4. Supervisor-Task
    /// 5. Metriken, Observability-Server, optionale Aufnahme
    pub async fn starten(config: ClientConfig) -> Result<Self> {
        config.pruefen()?;
        let ereignisse = EreignisKanal::neu();
        let metriken = KlangraumMetriken::neu()?;
        let health = HealthState::neu();

        // --- Routing-Matrix ---
        let fabrik = Arc::new(StandardSinkFabrik::neu());
        let (matrix, mixer) =
            RoutingMatrix::neu(config.matrix_config(), fabrik.clone(), ereignisse.clone());
        let bericht = matrix.neu_laden(&config.busse, config.vorgaben(), config.standard_bus())?;
        metriken.busse_aktiv.set(config.busse.len() as i64);
        tracing::info!(
            busse = bericht.erstellt.len(),
            standard_bus = ?config.audio.standard_bus,
            "Routing-Matrix bereit"
        );

        // --- Mix-Engine ---
        let engine = MixEngine::starten(mixer)?;
        health.mixer_setzen(true);

        // --- Transporte ---
        let (transport_tx, transport_rx) = mpsc::channel(TRANSPORT_KAPAZITAET);
        let transport = UdpDirektTransport::binden(config.verbindung.udp_bind, transport_tx).await?;

        let (kanal_tx, kanal_rx) = mpsc::channel::<KanalNachricht>(KANAL_KAPAZITAET);
        let signaling = SignalingVerbindung::verbinden(
            &config.signaling.adresse,
            config.signaling.sende_queue,
            kanal_tx,
            health.clone(),
        )
        .await?;

        // --- Supervisor ---
        let register: Arc<dyn QuellenRegister> = Arc::new(matrix.clone());
        let supervisor = PeerSupervisor::neu(
            config.supervisor_config(),
            Box::new(transport),
            signaling.kanal(),
            register,
            ereignisse.clone(),
        );
        let (task, handle) = SupervisorTask::neu(supervisor, transport_rx, kanal_rx, STANDARD_TAKT);
        let supervisor_task = tokio::spawn(task.run());

        // --- Hintergrund ---
        let mut hintergrund = vec![tokio::spawn(metriken_uebernehmen(
            handle.clone(),
            matrix.clone(),
            metriken.clone(),
            Duration::from_millis(config.observability.intervall_ms.max(10)),
        ))];

        if config.observability.aktiviert {
            let bind = config.observability.bind_adresse;
            let (m, h) = (metriken.clone(), health.clone());
            hintergrund.push(tokio::spawn(async move {
                if let Err(e) = klangraum_observability::observability_server_starten(bind, m, h).await
                {
                    tracing::error!(fehler = %e, "Observability-Server beendet");
                }
            }));
        }

        let aufnahme = if config.audio.aufnahme {
            let aufnahme_config = AufnahmeConfig {
                geraet: config.audio.eingabegeraet.clone(),
                format: AudioFormat::neu(config.audio.sample_rate, 1),
                frame_groesse: config.audio.aufnahme_frames,
            };
            let ziel = handle.clone();
            Some(Aufnahme::starten(
                aufnahme_config,
                ParticipantId::new(),
                move |frame| {
                    ziel.lokaler_frame(frame);
                },
            )?)
        } else {
            None
        };

        tracing::info!(modus = ?config.verbindung.modus, "Client laeuft");

        Ok(Self {
            config,
            matrix,
            fabrik,
            ereignisse,
            metriken,
            health,
            supervisor: handle,
            engine: Some(engine),
            supervisor_task: Some(supervisor_task),
            hintergrund,
            _signaling: signaling,
            _aufnahme: aufnahme,
        })
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn matrix(&self) -> &RoutingMatrix {
        &self.matrix
    }

    pub fn supervisor(&self) -> &SupervisorHandle {
        &self.supervisor
    }

    pub fn ereignisse(&self) -> &EreignisKanal {
        &self.ereignisse
    }

    pub fn metriken(&self) -> &KlangraumMetriken {
        &self.metriken
    }

    pub fn health(&self) -> &HealthState {
        &self.health
    }

    /// Mitschnitt eines Busses mit `speicher`-Senke
    pub fn speicher_abzug(&self, bus_id: &BusId) -> Option<SpeicherAbzug> {
        self.fabrik.speicher_abzug(bus_id)
    }

    /// Uebernimmt Busse, Zuweisungen und Standard-Bus einer neuen Konfiguration
    ///
    /// Laufende Verbindungen und unveraenderte Busse bleiben unberuehrt.
    /// Format und Zeitlimits greifen erst nach einem Neustart.
    pub fn neu_laden(&mut self, neue: ClientConfig) -> Result<ReloadBericht> {
        neue.pruefen()?;
        if neue.format() != self.config.format()
            || neue.audio.zyklus_frames != self.config.audio.zyklus_frames
        {
            tracing::warn!("Audio-Format oder Zyklusgroesse geaendert, gilt erst nach Neustart");
        }

        let bericht = self
            .matrix
            .neu_laden(&neue.busse, neue.vorgaben(), neue.standard_bus())?;
        self.metriken.busse_aktiv.set(neue.busse.len() as i64);
        tracing::info!(
            erstellt = bericht.erstellt.len(),
            entfernt = bericht.entfernt.len(),
            aktualisiert = bericht.aktualisiert.len(),
            zuweisungen = bericht.zuweisungen_geaendert,
            "Konfiguration neu geladen"
        );

        // Nur die neu ladbaren Teile uebernehmen
        self.config.busse = neue.busse;
        self.config.zuweisungen = neue.zuweisungen;
        self.config.audio.standard_bus = neue.audio.standard_bus;
        Ok(bericht)
    }

    /// Schliesst alle Verbindungen und stoppt die Mix-Engine
    pub async fn beenden(mut self) {
        self.supervisor.beenden().await;
        if let Some(task) = self.supervisor_task.take() {
            if let Err(e) = task.await {
                tracing::warn!(fehler = %e, "Supervisor-Task abgebrochen");
            }
        }
        if let Some(engine) = self.engine.take() {
            engine.stoppen();
        }
        self.health.mixer_setzen(false);
        tracing::info!("Client beendet");
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        for task in &self.hintergrund {
            task.abort();
        }
        if let Some(task) = &self.supervisor_task {
            task.abort();
        }
    }
}

/// Uebertraegt periodisch die Zaehler von Supervisor und Mixer nach Prometheus
async fn metriken_uebernehmen(
    supervisor: SupervisorHandle,
    matrix: RoutingMatrix,
    metriken: KlangraumMetriken,
    intervall: Duration,
) {
    let mut takt = tokio::time::interval(intervall);
    loop {
        takt.tick().await;
        let Ok(stat) = supervisor.statistik().await else {
            tracing::debug!("Supervisor beendet, Metriken-Task stoppt");
            break;
        };

        let pro_zustand: Vec<(String, usize)> = stat
            .pro_zustand
            .iter()
            .map(|(zustand, anzahl)| (zustand.to_string(), *anzahl))
            .collect();
        metriken.verbindungen_setzen(pro_zustand.iter().map(|(z, n)| (z.as_str(), *n)));

        KlangraumMetriken::nachziehen(&metriken.relay_gesendet, stat.relay.gesendet);
        KlangraumMetriken::nachziehen(&metriken.relay_empfangen, stat.relay.empfangen);
        KlangraumMetriken::nachziehen(&metriken.relay_verspaetet, stat.relay.verspaetet_verworfen);

        let mix = matrix.statistik();
        KlangraumMetriken::nachziehen(&metriken.mixer_zyklen, mix.zyklen);
        KlangraumMetriken::nachziehen(&metriken.mixer_ueberlaeufe, mix.ueberlaeufe);
        KlangraumMetriken::nachziehen(&metriken.mixer_frames_fehlend, mix.frames_fehlend);
        KlangraumMetriken::nachziehen(&metriken.bus_schreibfehler, mix.schreibfehler);
    }
}
